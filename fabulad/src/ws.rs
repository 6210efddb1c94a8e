//! WebSocket endpoint for front-end subscribers.
//!
//! Each connection registers with the hub and gets a writer task that
//! drains its bounded queue, pings every 30 seconds and sends a close
//! frame when the queue closes. The reader half only watches for the
//! peer going away.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use fabula::Hub;
use futures::{SinkExt, StreamExt};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Run one subscriber session until either side hangs up.
pub async fn subscriber_session(socket: WebSocket, hub: Arc<Hub>) {
    let (id, mut queue) = hub.register();
    let (mut sink, mut source) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    hub.unregister(id);
}
