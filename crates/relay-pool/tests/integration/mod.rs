//! Integration tests for the relay pool against in-process relays
//!
//! Each test starts one or more [`TestRelay`]s: minimal NIP-01 relays on
//! 127.0.0.1 that answer every REQ with one stored event and an EOSE, and can
//! push frames or drop their connections on demand.

pub mod error_handling;
pub mod pool;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_pool::{PoolMessage, RelayMessage, SubscriptionStream};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{Duration, sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::{CancellationToken, DropGuard};

pub const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[derive(Clone)]
enum Command {
    Frame(String),
    Disconnect,
}

/// A local relay speaking just enough NIP-01 for the pool.
pub struct TestRelay {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    commands: broadcast::Sender<Command>,
    _guard: DropGuard,
}

impl TestRelay {
    /// Start a relay on an ephemeral port.
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (commands, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();

        let accept_received = Arc::clone(&received);
        let accept_commands = commands.clone();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                };
                tokio::spawn(serve(
                    stream,
                    Arc::clone(&accept_received),
                    accept_commands.subscribe(),
                    accept_cancel.clone(),
                ));
            }
        });

        Self {
            addr,
            received,
            commands,
            _guard: cancel.drop_guard(),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Frames received from clients, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Send a raw frame to every connected client.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.commands.send(Command::Frame(frame.into()));
    }

    /// Send an EVENT for `sub_id` to every connected client.
    pub fn push_event(&self, sub_id: &str, content: &str) {
        self.push(json!(["EVENT", sub_id, event_json(content)]).to_string());
    }

    /// Drop every client connection without a close handshake.
    pub fn disconnect_all(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Wait until a received frame satisfies `pred`.
    pub async fn wait_for_frame(&self, pred: impl Fn(&Value) -> bool) -> Value {
        timeout(WAIT, async {
            loop {
                let found = self
                    .received()
                    .iter()
                    .filter_map(|frame| serde_json::from_str::<Value>(frame).ok())
                    .find(|frame| pred(frame));
                if let Some(frame) = found {
                    return frame;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay never received the expected frame")
    }

    /// Number of received frames of the given type for `sub_id`.
    pub fn count(&self, kind: &str, sub_id: &str) -> usize {
        self.received()
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(frame).ok())
            .filter(|frame| frame[0] == kind && frame[1] == sub_id)
            .count()
    }
}

async fn serve(
    stream: TcpStream,
    received: Arc<Mutex<Vec<String>>>,
    mut commands: broadcast::Receiver<Command>,
    cancel: CancellationToken,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            command = commands.recv() => match command {
                Ok(Command::Frame(frame)) => {
                    if sink.send(Message::text(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(Command::Disconnect) | Err(_) => return,
            },
            incoming = source.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                };
                received.lock().push(text.clone());
                for reply in respond(&text) {
                    if sink.send(Message::text(reply)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn respond(frame: &str) -> Vec<String> {
    let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(frame) else {
        return vec![json!(["NOTICE", "invalid: not a JSON array"]).to_string()];
    };
    match (parts.first().and_then(Value::as_str), parts.get(1)) {
        (Some("REQ"), Some(Value::String(id))) => vec![
            json!(["EVENT", id, event_json("stored")]).to_string(),
            json!(["EOSE", id]).to_string(),
        ],
        (Some("EVENT"), Some(event)) => {
            vec![json!(["OK", event["id"], true, ""]).to_string()]
        }
        _ => Vec::new(),
    }
}

pub fn event_json(content: &str) -> Value {
    json!({
        "id": format!("id-{content}"),
        "pubkey": "pk",
        "created_at": 1_700_000_000u64,
        "kind": 1,
        "tags": [],
        "content": content,
        "sig": "sig",
    })
}

/// Pop the next message, failing the test after [`WAIT`].
pub async fn next_message(sub: &mut SubscriptionStream) -> PoolMessage {
    timeout(WAIT, sub.pop())
        .await
        .expect("timed out waiting for a subscription message")
        .expect("subscription stream ended")
}

/// Pop messages until an EVENT arrives and return its content.
pub async fn next_event(sub: &mut SubscriptionStream) -> (String, String) {
    loop {
        let msg = next_message(sub).await;
        if let RelayMessage::Event { event, .. } = msg.message {
            return (msg.relay_url.to_string(), event.content);
        }
    }
}

/// Create an unreachable relay URL
pub fn unreachable_relay_url() -> String {
    "ws://127.0.0.1:1".to_string()
}
