//! `addon.toml`: addon metadata and its settings schema.
//!
//! ```toml
//! [info]
//! name = "Clock"
//! version = "1.2.0"
//!
//! [[settings]]
//! id = "format"
//! name = "Time format"
//! type = "select"
//! default = "24h"
//! options = ["12h", { value = "24h", label = "24 hour" }]
//! ```

use crate::config::AddonConfig;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

pub const MANIFEST_FILE: &str = "addon.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddonInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingSpec {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: SettingKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SettingKind {
    Boolean {
        default: bool,
    },
    Text {
        #[serde(default)]
        default: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
    },
    Color {
        default: String,
    },
    Range {
        default: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    Select {
        default: Value,
        #[serde(default)]
        options: Vec<SelectOption>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectOption {
    Labeled { value: Value, label: String },
    Plain(Value),
}

impl SelectOption {
    pub fn value(&self) -> &Value {
        match self {
            SelectOption::Labeled { value, .. } => value,
            SelectOption::Plain(value) => value,
        }
    }
}

impl SettingSpec {
    pub fn default_value(&self) -> Value {
        match &self.kind {
            SettingKind::Boolean { default } => Value::Bool(*default),
            SettingKind::Text { default, .. } | SettingKind::Color { default } => {
                Value::String(default.clone())
            }
            SettingKind::Range { default, .. } => number(*default),
            SettingKind::Select { default, .. } => default.clone(),
        }
    }

    /// Check a candidate value against this setting's type.
    pub fn check(&self, value: &Value) -> Result<()> {
        let invalid = |reason: String| CoreError::InvalidSetting {
            setting: self.id.clone(),
            reason,
        };
        match &self.kind {
            SettingKind::Boolean { .. } => {
                if !value.is_boolean() {
                    return Err(invalid(format!("expected a boolean, got {value}")));
                }
            }
            SettingKind::Text { .. } => {
                if !value.is_string() {
                    return Err(invalid(format!("expected text, got {value}")));
                }
            }
            SettingKind::Color { .. } => match value.as_str() {
                Some(s) if is_color(s) => {}
                _ => return Err(invalid(format!("expected a color, got {value}"))),
            },
            SettingKind::Range { min, max, .. } => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| invalid(format!("expected a number, got {value}")))?;
                if let Some(min) = min.filter(|min| n < *min) {
                    return Err(invalid(format!("{n} is below the minimum {min}")));
                }
                if let Some(max) = max.filter(|max| n > *max) {
                    return Err(invalid(format!("{n} is above the maximum {max}")));
                }
            }
            SettingKind::Select { options, .. } => {
                if !options.iter().any(|o| o.value() == value) {
                    return Err(invalid(format!("{value} is not one of the options")));
                }
            }
        }
        Ok(())
    }

    fn validate_schema(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("setting with empty id".into());
        }
        if self.id == "enabled" {
            return Err("setting id 'enabled' is reserved".into());
        }
        match &self.kind {
            SettingKind::Range { min, max, step, .. } => {
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(format!("setting '{}': min {min} > max {max}", self.id));
                    }
                }
                if step.is_some_and(|s| s <= 0.0) {
                    return Err(format!("setting '{}': step must be positive", self.id));
                }
            }
            SettingKind::Select { options, .. } if options.is_empty() => {
                return Err(format!("setting '{}': select needs at least one option", self.id));
            }
            _ => {}
        }
        self.check(&self.default_value())
            .map_err(|e| format!("bad default: {e}"))
    }
}

fn number(n: f64) -> Value {
    // Integral values stay integers so `5` round-trips as `5`, not `5.0`.
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// `#rgb`, `#rgba`, `#rrggbb`, `#rrggbbaa` or a CSS `rgb()`/`rgba()` form.
fn is_color(s: &str) -> bool {
    if let Some(hex) = s.strip_prefix('#') {
        return matches!(hex.len(), 3 | 4 | 6 | 8) && hex.chars().all(|c| c.is_ascii_hexdigit());
    }
    (s.starts_with("rgb(") || s.starts_with("rgba(")) && s.ends_with(')')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddonManifest {
    pub info: AddonInfo,
    #[serde(default)]
    pub settings: Vec<SettingSpec>,
}

impl AddonManifest {
    /// Structural parse only. Backends may still fill in settings (select
    /// options, say), so callers run [`AddonManifest::validate`] once the
    /// settings are final. `addon` is only used to label errors.
    pub fn parse(addon: &str, content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CoreError::Validation {
            addon: addon.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn validate(&self, addon: &str) -> Result<()> {
        let fail = |reason: String| CoreError::Validation {
            addon: addon.to_string(),
            reason,
        };
        if self.info.name.trim().is_empty() {
            return Err(fail("info.name is empty".into()));
        }
        if self.info.version.trim().is_empty() {
            return Err(fail("info.version is empty".into()));
        }

        let mut seen = HashSet::new();
        for setting in &self.settings {
            if !seen.insert(setting.id.as_str()) {
                return Err(fail(format!("duplicate setting id '{}'", setting.id)));
            }
            setting.validate_schema().map_err(fail)?;
        }
        Ok(())
    }

    pub fn setting(&self, id: &str) -> Option<&SettingSpec> {
        self.settings.iter().find(|s| s.id == id)
    }

    pub fn defaults(&self) -> AddonConfig {
        self.settings
            .iter()
            .map(|s| (s.id.clone(), s.default_value()))
            .collect()
    }
}
