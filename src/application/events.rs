//! Typed worker event stream.
//!
//! Workers write one JSON object per stdout line; the supervisor parses each
//! line into a [`WorkerEvent`] and fans it out through a per-job broadcast
//! channel. Producers never block: a slow subscriber lags and skips, it does
//! not stall the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum WorkerEvent {
    Status {
        level: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
    Progress {
        epoch: i64,
        step: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loss: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lr: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resources: Option<ResourceSample>,
    },
    Artifact {
        kind: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<i64>,
    },
    Metric {
        dataset_id: String,
        name: String,
        value: f64,
    },
    /// Worker environment report (interpreter, library versions, device).
    Env(JsonValue),
    /// Worker-side model details (parameter count, tokenizer, dtype).
    Model(JsonValue),
    /// Worker-side dataset summary (example counts per split).
    Dataset(JsonValue),
    Stderr {
        message: String,
    },
    Exited {
        cancelled: bool,
        success: bool,
    },
    /// Kinds this version does not understand are preserved, not dropped.
    #[serde(untagged)]
    Unknown(JsonValue),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceSample {
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub ram_rss_bytes: Option<i64>,
    #[serde(default)]
    pub gpu_util_percent: Option<f64>,
}

impl WorkerEvent {
    /// Parse one stdout line. Non-JSON lines are plain logging from the
    /// worker and yield no event.
    pub fn parse_line(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

const CHANNEL_CAPACITY: usize = 256;

/// Per-job broadcast channels, keyed by run or evaluation id.
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<WorkerEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<WorkerEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        // Subscribing to an already-closed job re-creates its entry, so drop
        // every channel whose receivers are all gone to keep the map from
        // accumulating dead job ids.
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fire-and-forget publish. No subscribers is not an error.
    pub fn publish(&self, job_id: &str, event: WorkerEvent) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(job_id) {
            let _ = sender.send(event);
        }
    }

    /// Drop the channel once the job is finished; late subscribers get a
    /// fresh (empty) channel.
    pub fn close(&self, job_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(job_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_line() {
        let line = r#"{"kind":"progress","payload":{"epoch":1,"step":42,"loss":0.35,"resources":{"cpu_percent":55.0}}}"#;
        match WorkerEvent::parse_line(line) {
            Some(WorkerEvent::Progress {
                epoch, step, loss, ..
            }) => {
                assert_eq!(epoch, 1);
                assert_eq!(step, 42);
                assert_eq!(loss, Some(0.35));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn non_json_lines_are_ignored() {
        assert!(WorkerEvent::parse_line("plain progress text").is_none());
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let line = r#"{"kind":"telemetry_v2","payload":{"x":1}}"#;
        assert!(matches!(
            WorkerEvent::parse_line(line),
            Some(WorkerEvent::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("run-1");
        bus.publish(
            "run-1",
            WorkerEvent::Stderr {
                message: "oom".to_string(),
            },
        );
        match rx.recv().await.unwrap() {
            WorkerEvent::Stderr { message } => assert_eq!(message, "oom"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(
            "run-2",
            WorkerEvent::Exited {
                cancelled: false,
                success: true,
            },
        );
    }

    #[test]
    fn abandoned_channels_do_not_accumulate() {
        let bus = EventBus::new();
        for i in 0..32 {
            // Subscribe to a finished job, then walk away.
            let rx = bus.subscribe(&format!("run-{i}"));
            bus.close(&format!("run-{i}"));
            let _rx_again = bus.subscribe(&format!("run-{i}"));
            drop(rx);
        }
        let live = bus.subscribe("run-live");
        let channels = bus.channels.lock().unwrap();
        assert_eq!(channels.len(), 1);
        assert!(channels.contains_key("run-live"));
        drop(live);
    }
}
