//! In-process stand-ins for the eWeLink cloud, used by the transport and
//! registry tests.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

/// A WebSocket server speaking just enough of the cloud protocol: it accepts
/// the `userOnline` handshake and acknowledges every command by sequence.
pub(crate) struct FakeCloud {
    pub port: u16,
    /// Every JSON frame the client sent, in order.
    pub frames: mpsc::UnboundedReceiver<Value>,
    /// When each frame in `frames` arrived.
    pub arrivals: Arc<Mutex<Vec<Instant>>>,
}

impl FakeCloud {
    pub async fn start(handshake_error: i64) -> Self {
        Self::scripted(vec![handshake_error], false).await
    }

    /// Answers the n-th handshake with `handshakes[n]`, repeating the last
    /// code. With `close_after_handshake` every accepted session is closed
    /// right after the handshake reply.
    pub async fn scripted(handshakes: Vec<i64>, close_after_handshake: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, frames) = mpsc::unbounded_channel();
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let handshakes = Arc::new(handshakes);
        let accepted = Arc::new(AtomicUsize::new(0));

        let stamps = arrivals.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let tx = tx.clone();
                let stamps = stamps.clone();
                let handshakes = handshakes.clone();
                let accepted = accepted.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                            continue;
                        };
                        let mut close = false;
                        let reply = if frame["action"] == "userOnline" {
                            let n = accepted.fetch_add(1, Ordering::SeqCst);
                            let code = handshakes
                                .get(n)
                                .or(handshakes.last())
                                .copied()
                                .unwrap_or(0);
                            close = code == 0 && close_after_handshake;
                            json!({"error": code, "apikey": frame["apikey"]})
                        } else {
                            json!({
                                "error": 0,
                                "deviceid": frame["deviceid"],
                                "apikey": frame["apikey"],
                                "sequence": frame["sequence"],
                            })
                        };
                        stamps.lock().push(Instant::now());
                        let _ = tx.send(frame);
                        if ws.send(Message::text(reply.to_string())).await.is_err() {
                            break;
                        }
                        if close {
                            let _ = ws.close(None).await;
                            break;
                        }
                    }
                });
            }
        });

        Self {
            port,
            frames,
            arrivals,
        }
    }

    /// JSON body of the `/dispatch/app` reply pointing at this server.
    pub fn dispatch_body(&self) -> Value {
        json!({"error": 0, "reason": "ok", "IP": "127.0.0.1", "port": self.port, "domain": "127.0.0.1"})
    }
}

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
