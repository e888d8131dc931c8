// Single-writer outbound path
//
// Both forwarding loops hand finished messages to a bounded queue; one writer
// task owns the client sink and serializes every frame onto it. A message is
// therefore written whole before the next one starts.

use crate::error::{RelayError, RelayResult};
use crate::types::ServerMessage;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Cloneable producer handle of the outbound queue
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<ServerMessage>,
}

impl Outbound {
    /// Queue of `capacity` messages drained by a writer task over `sink`.
    ///
    /// The writer cancels `cancel` when the sink fails, so every loop of the
    /// session observes a dead client through the same token.
    pub fn spawn<S>(sink: S, capacity: usize, cancel: CancellationToken) -> (Self, JoinHandle<()>)
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: Display,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(run_writer(sink, rx, cancel));
        (Self { tx }, writer)
    }

    /// Enqueue one message; fails once the writer is gone
    pub async fn send(&self, message: ServerMessage) -> RelayResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| RelayError::ClientDisconnected)
    }
}

async fn run_writer<S>(mut sink: S, mut rx: mpsc::Receiver<ServerMessage>, cancel: CancellationToken)
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: Display,
{
    while let Some(message) = rx.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(json.into())).await {
            debug!("Client sink closed: {}", e);
            cancel.cancel();
            return;
        }
    }

    // All producers dropped: the session is over
    if let Err(e) = sink.close().await {
        debug!("Error closing client sink: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_writer_serializes_in_queue_order() {
        let (sink, mut received) = fmpsc::unbounded::<Message>();
        let cancel = CancellationToken::new();
        let (outbound, writer) = Outbound::spawn(sink, 4, cancel.clone());

        outbound.send(ServerMessage::error("one")).await.unwrap();
        outbound
            .send(ServerMessage::Channels {
                channels: vec!["Cz".to_string()],
            })
            .await
            .unwrap();
        drop(outbound);
        writer.await.unwrap();

        let texts: Vec<String> = received
            .by_ref()
            .map(|m| match m {
                Message::Text(text) => text.as_str().to_string(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect()
            .await;
        assert_eq!(texts, vec![r#"{"error":"one"}"#, r#"{"channels":["Cz"]}"#]);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_dead_sink_cancels_session() {
        let (sink, received) = fmpsc::unbounded::<Message>();
        drop(received);
        let cancel = CancellationToken::new();
        let (outbound, writer) = Outbound::spawn(sink, 4, cancel.clone());

        outbound.send(ServerMessage::error("lost")).await.unwrap();
        writer.await.unwrap();

        assert!(cancel.is_cancelled());
        assert!(matches!(
            outbound.send(ServerMessage::error("again")).await,
            Err(RelayError::ClientDisconnected)
        ));
    }
}
