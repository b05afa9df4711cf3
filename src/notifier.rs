use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

/// Something the reconciler finished doing, for humans to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Pulled {
        id: String,
        title: String,
        moved_from: Option<String>,
    },
    Pushed {
        id: String,
        title: String,
        fields: Vec<String>,
    },
    Deleted {
        id: String,
        title: Option<String>,
    },
}

impl SyncEvent {
    pub fn summary(&self) -> String {
        match self {
            SyncEvent::Pulled {
                id,
                title,
                moved_from: Some(from),
            } => format!("{id} {title} pulled (moved from {from})"),
            SyncEvent::Pulled { id, title, .. } => format!("{id} {title} pulled"),
            SyncEvent::Pushed { id, title, fields } => {
                format!("{id} {title} pushed ({})", fields.join(", "))
            }
            SyncEvent::Deleted { id, title } => match title {
                Some(title) => format!("{id} {title} deleted remotely"),
                None => format!("{id} deleted remotely"),
            },
        }
    }
}

/// Fire-and-forget notification target. Implementations must never fail the
/// caller; errors are logged and dropped.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: SyncEvent);
}

pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: SyncEvent) {
        info!(target: "ticketsync::events", "{}", event.summary());
    }
}

/// Posts `{"text": ...}` to a chat incoming-webhook URL on a detached task.
pub struct ChatWebhookSink {
    url: String,
    client: reqwest::Client,
}

impl ChatWebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

impl NotificationSink for ChatWebhookSink {
    fn notify(&self, event: SyncEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available for chat notification");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let body = json!({ "text": event.summary(), "event": event });
        handle.spawn(async move {
            let result = client.post(&url).json(&body).send().await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(status = %resp.status(), "chat notification rejected"),
                Err(e) => warn!(error = %e, "chat notification failed"),
            }
        });
    }
}

/// Fans one event out to several sinks.
pub struct MultiSink(pub Vec<Box<dyn NotificationSink>>);

impl NotificationSink for MultiSink {
    fn notify(&self, event: SyncEvent) {
        for sink in &self.0 {
            sink.notify(event.clone());
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<SyncEvent>>,
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, event: SyncEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use std::sync::Arc;

    #[test]
    fn summaries_read_naturally() {
        let pulled = SyncEvent::Pulled {
            id: "ENG-1".into(),
            title: "Fix login".into(),
            moved_from: Some("todo".into()),
        };
        assert_eq!(pulled.summary(), "ENG-1 Fix login pulled (moved from todo)");

        let pushed = SyncEvent::Pushed {
            id: "ENG-1".into(),
            title: "Fix login".into(),
            fields: vec!["state".into(), "title".into()],
        };
        assert_eq!(pushed.summary(), "ENG-1 Fix login pushed (state, title)");
    }

    #[test]
    fn serializes_with_event_tag() {
        let event = SyncEvent::Deleted {
            id: "ENG-2".into(),
            title: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "deleted");
        assert_eq!(json["id"], "ENG-2");
    }

    #[test]
    fn multi_sink_fans_out() {
        struct Forward(Arc<RecordingSink>);
        impl NotificationSink for Forward {
            fn notify(&self, event: SyncEvent) {
                self.0.notify(event);
            }
        }

        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let sink = MultiSink(vec![Box::new(Forward(a.clone())), Box::new(Forward(b.clone()))]);
        sink.notify(SyncEvent::Deleted {
            id: "ENG-3".into(),
            title: None,
        });
        assert_eq!(a.events.lock().unwrap().len(), 1);
        assert_eq!(b.events.lock().unwrap().len(), 1);
    }
}
