use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;

/// Lines replayed to a new SSE subscriber before its live tail starts.
const RING_CAPACITY: usize = 500;
const CHANNEL_CAPACITY: usize = 1024;

/// Fan-out point for the process log: every traced event becomes one JSON
/// line, broadcast to live SSE subscribers and kept in a bounded replay
/// ring.
pub struct ProcessLog {
    tx: broadcast::Sender<String>,
    ring: Mutex<VecDeque<String>>,
}

impl ProcessLog {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            tx,
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
        })
    }

    /// Replay snapshot plus a live receiver. The receiver is created while
    /// the ring lock is held so no line falls between replay and tail.
    pub fn subscribe(&self) -> (Vec<String>, broadcast::Receiver<String>) {
        let ring = self.ring_guard();
        let rx = self.tx.subscribe();
        (ring.iter().cloned().collect(), rx)
    }

    fn record(&self, line: String) {
        let _ = self.tx.send(line.clone());
        let mut ring = self.ring_guard();
        ring.push_back(line);
        while ring.len() > RING_CAPACITY {
            ring.pop_front();
        }
    }

    fn ring_guard(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Which part of the engine emitted an event, from the last segment of its
/// module path. The taxonomy follows the engine's own structure: the five
/// step runners, the deploy watcher, the CEN-PE subsystem, session/observer
/// machinery, and the GitOps plumbing underneath it.
fn source_of(target: &str) -> &'static str {
    match target.rsplit("::").next().unwrap_or(target) {
        "merge" | "build" | "gitops" | "deploy" | "qa" => "step",
        "watcher" => "deploy_watch",
        "diagnostics" | "llm" => "cenpe",
        "observer" | "session" | "registry" => "sessions",
        "git" | "lock" | "services" | "persist" => "repo",
        _ => "process",
    }
}

/// Collects an event's message and any extra key/value fields. `Visit`'s
/// default `record_*` methods all funnel into `record_debug`, so one method
/// covers every field type.
#[derive(Default)]
struct EventText {
    message: String,
    extras: Vec<(&'static str, String)>,
}

impl Visit for EventText {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        let rendered = rendered
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(&rendered)
            .to_string();
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.extras.push((field.name(), rendered));
        }
    }
}

/// `tracing` layer feeding a [`ProcessLog`].
pub struct ProcessLogLayer(pub Arc<ProcessLog>);

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ProcessLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // TRACE is too chatty to replay to browsers.
        if *meta.level() > tracing::Level::DEBUG {
            return;
        }

        let mut text = EventText::default();
        event.record(&mut text);

        let mut line = serde_json::json!({
            "at": chrono::Utc::now().to_rfc3339(),
            "level": meta.level().as_str().to_lowercase(),
            "source": source_of(meta.target()),
            "text": text.message,
        });
        if !text.extras.is_empty() {
            let fields: serde_json::Map<String, serde_json::Value> = text
                .extras
                .into_iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
                .collect();
            line["fields"] = serde_json::Value::Object(fields);
        }

        self.0.record(line.to_string());
    }
}
