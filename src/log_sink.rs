//! Fire-and-forget operator log lines, POSTed to the control-plane API.
//!
//! The sender never blocks and never fails: messages go through a bounded
//! channel with `try_send`, and the forwarding task swallows every transport
//! error. Under control-plane outage, messages are dropped.
use crate::config::ConfigWatcher;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const QUEUE_DEPTH: usize = 256;
const POST_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct UiLogBody {
    message: String,
    source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<&'static str>,
}

/// Handle for posting one-line messages to the control-plane `/api/ui-log`.
///
/// Cheap to clone; all clones feed the same forwarding task.
#[derive(Clone)]
pub struct UiLog {
    tx: mpsc::Sender<UiLogBody>,
}

impl UiLog {
    /// Spawn the forwarding task and return the shared handle.
    pub fn spawn(config: Arc<ConfigWatcher>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(forward(rx, config));
        Self { tx }
    }

    pub fn log(&self, message: impl Into<String>, source: &'static str) {
        self.send(message.into(), source, None)
    }

    /// Like [UiLog::log] with a display color hint, e.g. `"red"` for failures.
    pub fn log_color(&self, message: impl Into<String>, source: &'static str, color: &'static str) {
        self.send(message.into(), source, Some(color))
    }

    fn send(&self, message: String, source: &'static str, color: Option<&'static str>) {
        // Drop on a full queue rather than block the pipeline.
        let _ = self.tx.try_send(UiLogBody {
            message,
            source,
            color,
        });
    }

    /// A sink with no forwarding task behind it; every message is dropped.
    /// Used where log delivery is genuinely optional (and in tests).
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

async fn forward(mut rx: mpsc::Receiver<UiLogBody>, config: Arc<ConfigWatcher>) {
    let client = match reqwest::Client::builder().timeout(POST_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return,
    };
    while let Some(body) = rx.recv().await {
        let settings = config.get();
        let url = format!(
            "http://{}:{}/api/ui-log",
            settings.api_host, settings.api_port
        );
        // Best-effort: any response is accepted, any error swallowed.
        let _ = client.post(&url).json(&body).send().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disconnected_sink_never_blocks() {
        let sink = UiLog::disconnected();
        for i in 0..1000 {
            sink.log(format!("message {i}"), "test");
            sink.log_color(format!("failure {i}"), "test", "red");
        }
    }
}
