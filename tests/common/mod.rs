#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use statter::{ConnectionConfig, KeepaliveConfig};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Probe timing short enough for a test to see escalation.
pub fn fast_keepalive() -> KeepaliveConfig {
    KeepaliveConfig {
        initial_delay_ms: 50,
        interval_ms: 50,
        retry_ms: 30,
        probe_timeout_ms: 50,
        max_failures: 3,
    }
}

pub fn config_for(addr: SocketAddr) -> ConnectionConfig {
    let mut config = ConnectionConfig::with_host(addr.ip().to_string(), addr.port());
    config.keepalive = fast_keepalive();
    config
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(Duration::from_secs(5), fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Answer registrations from the server's state and echo every `Set`.
    Echo,
    /// Complete the handshake, then never read or write again.
    Silent,
}

/// An in-process stand-in for the scoreboard server.
pub struct FakeScoreboard {
    pub addr: SocketAddr,
    state: Arc<Mutex<HashMap<String, Value>>>,
    clients: Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>>,
    uris: Arc<Mutex<Vec<String>>>,
    commands: mpsc::UnboundedReceiver<Value>,
}

impl FakeScoreboard {
    pub async fn spawn(mode: Mode) -> Self {
        Self::spawn_with_state(mode, &[]).await
    }

    pub async fn spawn_with_state(mode: Mode, initial: &[(&str, Value)]) -> Self {
        Self::spawn_with_options(mode, initial, Duration::ZERO).await
    }

    /// Like [`FakeScoreboard::spawn_with_state`], but every handshake waits
    /// `handshake_delay` before it is answered.
    pub async fn spawn_with_options(
        mode: Mode,
        initial: &[(&str, Value)],
        handshake_delay: Duration,
    ) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(
            initial
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        ));
        let clients = Arc::new(Mutex::new(Vec::new()));
        let uris = Arc::new(Mutex::new(Vec::new()));
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let server = Self {
            addr,
            state: state.clone(),
            clients: clients.clone(),
            uris: uris.clone(),
            commands,
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = state.clone();
                let clients = clients.clone();
                let uris = uris.clone();
                let commands_tx = commands_tx.clone();
                tokio::spawn(async move {
                    if !handshake_delay.is_zero() {
                        tokio::time::sleep(handshake_delay).await;
                    }
                    let record_uri = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        uris.lock().push(req.uri().to_string());
                        Ok(resp)
                    };
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, record_uri).await else {
                        return;
                    };
                    if mode == Mode::Silent {
                        let _held = ws;
                        std::future::pending::<()>().await;
                        return;
                    }

                    let (mut sink, mut source) = ws.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                    clients.lock().push(tx.clone());
                    let writer = tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            let closing = matches!(msg, Message::Close(_));
                            if sink.send(msg).await.is_err() || closing {
                                break;
                            }
                        }
                    });

                    while let Some(Ok(msg)) = source.next().await {
                        let Message::Text(text) = msg else { continue };
                        let Ok(command) = serde_json::from_str::<Value>(text.as_str()) else {
                            continue;
                        };
                        if let Some(reply) = respond(&state, &command) {
                            let _ = tx.send(Message::Text(reply.to_string().into()));
                        }
                        let _ = commands_tx.send(command);
                    }
                    writer.abort();
                });
            }
        });

        server
    }

    /// Send a raw frame to the most recent client.
    pub fn push(&self, frame: Value) {
        let clients = self.clients.lock();
        let client = clients.last().expect("no client connected");
        let _ = client.send(Message::Text(frame.to_string().into()));
    }

    /// Change a value server-side and push it to the most recent client.
    pub fn update(&self, key: &str, value: Value) {
        self.state.lock().insert(key.to_string(), value.clone());
        self.push(state_frame([(key.to_string(), value)]));
    }

    /// Close every open socket from the server side.
    pub fn close_all(&self) {
        for client in self.clients.lock().drain(..) {
            let _ = client.send(Message::Close(None));
        }
    }

    /// Request URIs of every accepted handshake, in order.
    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.uris.lock().len()
    }

    pub async fn next_command(&mut self) -> Value {
        within("a command from the client", self.commands.recv())
            .await
            .expect("server stopped")
    }

    /// Skip commands until one with the given `action` arrives.
    pub async fn next_action(&mut self, action: &str) -> Value {
        loop {
            let command = self.next_command().await;
            if command["action"] == action {
                return command;
            }
        }
    }

    /// Paths of the next `Register` command.
    pub async fn next_registration(&mut self) -> Vec<String> {
        let command = self.next_action("Register").await;
        command["paths"]
            .as_array()
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn state_frame<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (String, Value)>,
{
    let state: serde_json::Map<String, Value> = entries.into_iter().collect();
    serde_json::json!({ "state": state })
}

fn respond(state: &Mutex<HashMap<String, Value>>, command: &Value) -> Option<Value> {
    let mut state = state.lock();
    match command["action"].as_str()? {
        "Register" => {
            let mut reply = Vec::new();
            for path in command["paths"].as_array()? {
                let path = path.as_str()?;
                match path.strip_suffix("(*)") {
                    Some(prefix) => {
                        let prefix = format!("{prefix}(");
                        reply.extend(
                            state
                                .iter()
                                .filter(|(key, _)| key.starts_with(&prefix))
                                .map(|(key, value)| (key.clone(), value.clone())),
                        );
                    }
                    None => {
                        if let Some(value) = state.get(path) {
                            reply.push((path.to_owned(), value.clone()));
                        }
                    }
                }
            }
            (!reply.is_empty()).then(|| state_frame(reply))
        }
        "Set" => {
            let key = command["key"].as_str()?.to_owned();
            let mut value = command["value"].clone();
            if command["flag"] == "change" {
                let base = state.get(&key).and_then(Value::as_i64).unwrap_or(0);
                value = Value::from(base + value.as_i64().unwrap_or(0));
            }
            state.insert(key.clone(), value.clone());
            Some(state_frame([(key, value)]))
        }
        _ => None,
    }
}
