//! WebSocket event stream of job lifecycle changes.
//!
//! Dashboards subscribe on `/ws` and receive a JSON message every time a job
//! starts running or reaches a terminal state. Logs are not pushed here; they
//! are fetched by offset over HTTP.

use crate::job::JobView;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Maximum number of queued messages per subscriber
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum JobEvent {
    #[serde(rename = "job:started")]
    Started(JobView),

    #[serde(rename = "job:finished")]
    Finished(JobView),
}

/// Fan-out of job events to connected clients.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn broadcast(&self, event: JobEvent) {
        // No subscribers is the normal case when no dashboard is open.
        if let Ok(count) = self.tx.send(event) {
            debug!("Broadcast job event to {} client(s)", count);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<crate::api::AppState>,
) -> impl IntoResponse {
    let rx = app_state.events.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(socket: WebSocket, mut rx: broadcast::Receiver<JobEvent>) {
    info!("WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("WebSocket client lagged, skipped {} event(s)", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize job event: {:?}", e),
            }
        }
    });

    // Incoming messages are ignored; the loop only notices the close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, JobStatus, Target};
    use chrono::Utc;
    use std::path::PathBuf;

    fn view() -> JobView {
        JobView {
            id: "job-1".into(),
            kind: JobKind::Backup,
            target: Target::Nvme,
            components: vec!["config".into()],
            backup_id: "20260101T000000Z-job1job1".into(),
            status: JobStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            exit_reason: None,
            pgid: Some(1234),
            log_path: PathBuf::from("/tmp/job.log"),
        }
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        EventBus::new().broadcast(JobEvent::Started(view()));
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let job = view();
        bus.broadcast(JobEvent::Finished(job.clone()));
        assert_eq!(rx.recv().await.unwrap(), JobEvent::Finished(job));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&JobEvent::Started(view())).unwrap();
        assert!(json.contains("\"type\":\"job:started\""));
        assert!(json.contains("\"status\":\"running\""));
    }
}
