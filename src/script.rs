//! Addon code: `backend.lua` run in its own Lua VM, or nothing but static
//! files when an addon has no backend.
//!
//! A backend may define any of these globals:
//!
//! - `init(config)`, `stop()`, `on_timer(name, config)`
//! - `adjust_settings(settings)` returning the refined settings list
//! - `frontend(config)` returning the display script
//!
//! Any other global function can be invoked on demand with the current
//! config as its only argument; its return value comes back as JSON.
//!
//! and can call into the host through the `addon` table: `addon.id`,
//! `addon.print(msg)`, `addon.get_addon_dir()`, `addon.get_fonts_dir()`,
//! `addon.list_directory(path)`, `addon.list_fonts()`,
//! `addon.schedule(name, ms)` (only from `init`) and `addon.emit(value)`.

use crate::addon::{AddonError, AddonLoader, AddonModule, Asset, TimerRequest, FRONTEND_FILE};
use crate::config::AddonConfig;
use crate::events::{CoreEvent, EventBus};
use crate::manifest::SettingSpec;
use mlua::{Function, Lua, LuaSerdeExt};
use parking_lot::Mutex;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const BACKEND_FILE: &str = "backend.lua";

const FONT_EXTENSIONS: &[&str] = &["ttf", "otf", "woff", "woff2"];
const MIN_TIMER: Duration = Duration::from_millis(10);
const HOOKS: &[&str] = &["init", "stop", "on_timer", "adjust_settings", "frontend"];

/// Default [`AddonLoader`]: a fresh VM per load, so a reload never sees state
/// left over from the previous module.
pub struct ScriptLoader {
    fonts_dir: PathBuf,
    events: EventBus,
}

impl ScriptLoader {
    pub fn new(fonts_dir: PathBuf, events: EventBus) -> Self {
        Self { fonts_dir, events }
    }
}

impl AddonLoader for ScriptLoader {
    fn load(&self, id: &str, dir: &Path) -> Result<Box<dyn AddonModule>, AddonError> {
        let backend = dir.join(BACKEND_FILE);
        if !backend.is_file() {
            return Ok(Box::new(StaticModule {
                dir: dir.to_path_buf(),
                fonts_dir: self.fonts_dir.clone(),
            }));
        }
        let source = std::fs::read_to_string(&backend)?;
        let module = ScriptModule::new(id, dir, &self.fonts_dir, self.events.clone(), &source)?;
        tracing::debug!(addon = %id, "Loaded Lua backend");
        Ok(Box::new(module))
    }
}

/// Frontend-only addon.
pub struct StaticModule {
    dir: PathBuf,
    fonts_dir: PathBuf,
}

impl AddonModule for StaticModule {
    fn has_backend(&self) -> bool {
        false
    }

    fn init(&mut self, _config: &AddonConfig) -> Result<Vec<TimerRequest>, AddonError> {
        Ok(Vec::new())
    }

    fn has_stop(&self) -> bool {
        false
    }

    fn stop(&mut self) -> Result<(), AddonError> {
        Ok(())
    }

    fn on_timer(&mut self, _timer: &str, _config: &AddonConfig) -> Result<(), AddonError> {
        Ok(())
    }

    fn frontend_script(&mut self, config: &AddonConfig) -> Result<Option<String>, AddonError> {
        default_frontend_script(&self.dir, config)
    }

    fn export_asset(&mut self, name: &str) -> Result<Asset, AddonError> {
        read_asset(&self.dir, &self.fonts_dir, name)
    }
}

pub struct ScriptModule {
    lua: Lua,
    dir: PathBuf,
    fonts_dir: PathBuf,
    has_stop: bool,
    scheduling: Arc<AtomicBool>,
    scheduled: Arc<Mutex<Vec<TimerRequest>>>,
}

impl ScriptModule {
    pub fn new(id: &str, dir: &Path, fonts_dir: &Path, events: EventBus, source: &str) -> Result<Self, AddonError> {
        let lua = Lua::new();
        let scheduling = Arc::new(AtomicBool::new(false));
        let scheduled = Arc::new(Mutex::new(Vec::new()));

        install_host_api(&lua, id, dir, fonts_dir, events, scheduling.clone(), scheduled.clone())?;
        lua.load(source).set_name(format!("{id}/{BACKEND_FILE}")).exec()?;

        let has_stop = lua.globals().get::<_, Option<Function>>("stop")?.is_some();
        Ok(Self {
            lua,
            dir: dir.to_path_buf(),
            fonts_dir: fonts_dir.to_path_buf(),
            has_stop,
            scheduling,
            scheduled,
        })
    }

    fn function(&self, name: &str) -> mlua::Result<Option<Function<'_>>> {
        self.lua.globals().get(name)
    }
}

impl AddonModule for ScriptModule {
    fn has_backend(&self) -> bool {
        true
    }

    fn adjust_settings(&mut self, settings: Vec<SettingSpec>) -> Result<Vec<SettingSpec>, AddonError> {
        let Some(hook) = self.function("adjust_settings")? else {
            return Ok(settings);
        };
        let input = self.lua.to_value(&settings)?;
        let output: mlua::Value = hook.call(input)?;
        Ok(self.lua.from_value(output)?)
    }

    fn init(&mut self, config: &AddonConfig) -> Result<Vec<TimerRequest>, AddonError> {
        self.scheduled.lock().clear();
        let Some(init) = self.function("init")? else {
            return Ok(Vec::new());
        };
        let config = self.lua.to_value(config)?;

        self.scheduling.store(true, Ordering::SeqCst);
        let result = init.call::<_, ()>(config);
        self.scheduling.store(false, Ordering::SeqCst);

        let timers = std::mem::take(&mut *self.scheduled.lock());
        result?;
        Ok(timers)
    }

    fn has_stop(&self) -> bool {
        self.has_stop
    }

    fn stop(&mut self) -> Result<(), AddonError> {
        if let Some(stop) = self.function("stop")? {
            stop.call::<_, ()>(())?;
        }
        Ok(())
    }

    fn on_timer(&mut self, timer: &str, config: &AddonConfig) -> Result<(), AddonError> {
        let Some(hook) = self.function("on_timer")? else {
            return Ok(());
        };
        let config = self.lua.to_value(config)?;
        hook.call::<_, ()>((timer, config))?;
        Ok(())
    }

    fn frontend_script(&mut self, config: &AddonConfig) -> Result<Option<String>, AddonError> {
        if let Some(hook) = self.function("frontend")? {
            let lua_config = self.lua.to_value(config)?;
            if let Some(script) = hook.call::<_, Option<String>>(lua_config)? {
                return Ok(Some(script));
            }
        }
        default_frontend_script(&self.dir, config)
    }

    fn export_asset(&mut self, name: &str) -> Result<Asset, AddonError> {
        read_asset(&self.dir, &self.fonts_dir, name)
    }

    fn call(&mut self, function: &str, config: &AddonConfig) -> Result<Option<serde_json::Value>, AddonError> {
        if HOOKS.contains(&function) {
            return Ok(None);
        }
        let mlua::Value::Function(callable) = self.lua.globals().get::<_, mlua::Value>(function)? else {
            return Ok(None);
        };
        let input = self.lua.to_value(config)?;
        let output: mlua::Value = callable.call(input)?;
        Ok(Some(self.lua.from_value(output)?))
    }
}

fn install_host_api(
    lua: &Lua,
    id: &str,
    dir: &Path,
    fonts_dir: &Path,
    events: EventBus,
    scheduling: Arc<AtomicBool>,
    scheduled: Arc<Mutex<Vec<TimerRequest>>>,
) -> mlua::Result<()> {
    let api = lua.create_table()?;
    api.set("id", id)?;

    let addon_id = id.to_string();
    api.set(
        "print",
        lua.create_function(move |_, msg: String| {
            tracing::info!(addon = %addon_id, "{msg}");
            Ok(())
        })?,
    )?;

    let addon_dir = dir.display().to_string();
    api.set("get_addon_dir", lua.create_function(move |_, ()| Ok(addon_dir.clone()))?)?;

    let fonts = fonts_dir.display().to_string();
    api.set("get_fonts_dir", lua.create_function(move |_, ()| Ok(fonts.clone()))?)?;

    api.set(
        "list_directory",
        lua.create_function(|_, path: String| list_directory(Path::new(&path)).map_err(mlua::Error::external))?,
    )?;

    let fonts_path = fonts_dir.to_path_buf();
    api.set(
        "list_fonts",
        lua.create_function(move |lua, ()| lua.to_value(&list_fonts(&fonts_path)))?,
    )?;

    api.set(
        "schedule",
        lua.create_function(move |_, (name, ms): (String, u64)| {
            if !scheduling.load(Ordering::SeqCst) {
                return Err(mlua::Error::RuntimeError(
                    "addon.schedule can only be called from init".into(),
                ));
            }
            let every = Duration::from_millis(ms).max(MIN_TIMER);
            scheduled.lock().push(TimerRequest { name, every });
            Ok(())
        })?,
    )?;

    let addon_id = id.to_string();
    api.set(
        "emit",
        lua.create_function(move |lua, value: mlua::Value| {
            let payload: serde_json::Value = lua.from_value(value)?;
            events.emit(CoreEvent::AddonMessage {
                addon: addon_id.clone(),
                payload,
            });
            Ok(())
        })?,
    )?;

    lua.globals().set("addon", api)
}

fn list_directory(path: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FontOption {
    pub value: String,
    pub label: String,
}

/// Font files in the shared fonts dir, sorted by label, after a `default`
/// entry for the display's built-in font. A missing dir yields just `default`.
pub fn list_fonts(fonts_dir: &Path) -> Vec<FontOption> {
    let mut fonts = Vec::new();
    if let Ok(entries) = std::fs::read_dir(fonts_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_font = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| FONT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if !is_font || !path.is_file() {
                continue;
            }
            let (Some(file), Some(stem)) = (
                path.file_name().and_then(|n| n.to_str()),
                path.file_stem().and_then(|n| n.to_str()),
            ) else {
                continue;
            };
            fonts.push(FontOption {
                value: file.to_string(),
                label: stem.replace(['-', '_'], " "),
            });
        }
    }
    fonts.sort_by(|a, b| a.label.cmp(&b.label));
    fonts.insert(
        0,
        FontOption {
            value: "default".into(),
            label: "Default".into(),
        },
    );
    fonts
}

/// `frontend.js` with the addon's config injected ahead of it.
pub fn default_frontend_script(dir: &Path, config: &AddonConfig) -> Result<Option<String>, AddonError> {
    let path = dir.join(FRONTEND_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let script = std::fs::read_to_string(path)?;
    let config = serde_json::to_string(config).map_err(|e| AddonError::Asset(e.to_string()))?;
    Ok(Some(format!("window.addonConfig = {config};\n{script}")))
}

/// Look `name` up in the addon dir, then the fonts dir. Only plain relative
/// paths are accepted.
pub fn read_asset(addon_dir: &Path, fonts_dir: &Path, name: &str) -> Result<Asset, AddonError> {
    let relative = Path::new(name);
    let plain = !name.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(AddonError::Asset(format!("invalid asset path '{name}'")));
    }

    let path = [addon_dir, fonts_dir]
        .iter()
        .map(|base| base.join(relative))
        .find(|p| p.is_file())
        .ok_or_else(|| {
            AddonError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("asset '{name}' not found"),
            ))
        })?;

    Ok(Asset {
        name: name.to_string(),
        mime: mime_for(&path),
        bytes: std::fs::read(&path)?,
    })
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("signage-{tag}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_list_fonts_sorted_with_default_first() {
        let dir = temp_dir("fonts");
        std::fs::write(dir.join("Roboto-Bold.ttf"), b"x").unwrap();
        std::fs::write(dir.join("open_sans.woff2"), b"x").unwrap();
        std::fs::write(dir.join("readme.txt"), b"x").unwrap();

        let fonts = list_fonts(&dir);
        let labels: Vec<_> = fonts.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["Default", "Roboto Bold", "open sans"]);
        assert_eq!(fonts[1].value, "Roboto-Bold.ttf");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_fonts_dir() {
        let fonts = list_fonts(Path::new("/definitely/not/here"));
        assert_eq!(fonts.len(), 1);
        assert_eq!(fonts[0].value, "default");
    }

    #[test]
    fn test_asset_lookup_order_and_traversal() {
        let addon = temp_dir("addon");
        let fonts = temp_dir("fonts");
        std::fs::write(addon.join("logo.png"), b"addon").unwrap();
        std::fs::write(fonts.join("logo.png"), b"fonts").unwrap();
        std::fs::write(fonts.join("Inter.woff2"), b"font").unwrap();

        let asset = read_asset(&addon, &fonts, "logo.png").unwrap();
        assert_eq!(asset.bytes, b"addon");
        assert_eq!(asset.mime, "image/png");

        let font = read_asset(&addon, &fonts, "Inter.woff2").unwrap();
        assert_eq!(font.mime, "font/woff2");

        assert!(matches!(
            read_asset(&addon, &fonts, "../secret.txt"),
            Err(AddonError::Asset(_))
        ));
        assert!(matches!(read_asset(&addon, &fonts, "/etc/passwd"), Err(AddonError::Asset(_))));
        assert!(matches!(read_asset(&addon, &fonts, "nope.png"), Err(AddonError::Io(_))));

        let _ = std::fs::remove_dir_all(addon);
        let _ = std::fs::remove_dir_all(fonts);
    }

    #[test]
    fn test_frontend_gets_config_prefix() {
        let dir = temp_dir("frontend");
        assert!(default_frontend_script(&dir, &AddonConfig::new()).unwrap().is_none());

        std::fs::write(dir.join(FRONTEND_FILE), "draw();").unwrap();
        let config = json!({ "size": 48 }).as_object().unwrap().clone();
        let script = default_frontend_script(&dir, &config).unwrap().unwrap();
        assert_eq!(script, "window.addonConfig = {\"size\":48};\ndraw();");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_schedule_only_during_init() {
        let dir = temp_dir("lua");
        let source = r#"
            ticks = 0
            function init(config)
              addon.schedule("tick", config.every)
            end
            function on_timer(name, config)
              ticks = ticks + 1
              addon.schedule("again", 5)
            end
        "#;
        let mut module = ScriptModule::new("clock", &dir, &dir, EventBus::default(), source).unwrap();
        let config = json!({ "every": 250 }).as_object().unwrap().clone();

        let timers = module.init(&config).unwrap();
        assert_eq!(
            timers,
            vec![TimerRequest {
                name: "tick".into(),
                every: Duration::from_millis(250)
            }]
        );
        assert!(module.on_timer("tick", &config).is_err());
        assert!(!module.has_stop());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_syntax_error_fails_load() {
        let dir = temp_dir("lua-bad");
        let result = ScriptModule::new("bad", &dir, &dir, EventBus::default(), "function init(");
        assert!(matches!(result, Err(AddonError::Script(_))));
        let _ = std::fs::remove_dir_all(dir);
    }
}
