use crate::config::HostConfig;
use crate::peer::Peer;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Change notifications for the display loop and the admin layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum CoreEvent {
    #[serde(rename = "config-update")]
    ConfigUpdated(Box<HostConfig>),
    #[serde(rename = "media-update")]
    MediaUpdated { files: Vec<String> },
    #[serde(rename = "addons-update")]
    AddonsUpdated,
    #[serde(rename = "peer-update")]
    PeerUpdated(Peer),
    #[serde(rename = "peer-remove")]
    PeerRemoved(String),
    UpdateStaged(PathBuf),
    AddonMessage {
        addon: String,
        payload: serde_json::Value,
    },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::ConfigUpdated(_) => "config-update",
            CoreEvent::MediaUpdated { .. } => "media-update",
            CoreEvent::AddonsUpdated => "addons-update",
            CoreEvent::PeerUpdated(_) => "peer-update",
            CoreEvent::PeerRemoved(_) => "peer-remove",
            CoreEvent::UpdateStaged(_) => "update-staged",
            CoreEvent::AddonMessage { .. } => "addon-message",
        }
    }
}

/// Fire-and-forget broadcast. Emitting with nobody subscribed is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: CoreEvent) {
        tracing::trace!(event = event.name(), "Emitting event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tags() {
        let json = serde_json::to_value(CoreEvent::PeerRemoved("10.0.0.1:3006".into())).unwrap();
        assert_eq!(json["event"], "peer-remove");
        assert_eq!(json["data"], "10.0.0.1:3006");

        let json = serde_json::to_value(CoreEvent::AddonsUpdated).unwrap();
        assert_eq!(json["event"], "addons-update");

        let staged = CoreEvent::UpdateStaged(PathBuf::from("u.bin"));
        assert_eq!(serde_json::to_value(&staged).unwrap()["event"], staged.name());
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(CoreEvent::AddonsUpdated);
        let mut rx = bus.subscribe();
        bus.emit(CoreEvent::MediaUpdated { files: vec![] });
        assert_eq!(rx.recv().await.unwrap().name(), "media-update");
    }
}
