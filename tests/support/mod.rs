#![allow(dead_code)]
//! In-process STOMP broker and collaborator fakes shared by the
//! integration tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use chatsync::api::client::HistoryService;
use chatsync::api::events::ClientEvent;
use chatsync::config::Settings;
use chatsync::geo::{GeolocationError, GeolocationProvider, PositionOptions};
use chatsync::stomp::{self, Command, Frame};
use chatsync::{ChatEngine, ChatError, Conversation, Location, Message, Result};

/// Token the broker answers with an `ERROR` frame.
pub const REJECTED_TOKEN: &str = "rejected";

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected { user: String },
    Rejected { token: String },
    Subscribed { user: String, id: String, destination: String },
    Unsubscribed { user: String, id: String },
    Sent { user: String, destination: String, body: Value },
    Heartbeat { user: String },
    Disconnected { user: String },
    Closed { user: String },
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Value of the `heart-beat` header in `CONNECTED`.
    pub heartbeat: String,
    /// Deliver a copy of every send back to the sender as well.
    pub echo_to_sender: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            heartbeat: "0,0".into(),
            echo_to_sender: false,
        }
    }
}

enum Outbound {
    Text(String),
    Kill,
}

struct Session {
    user: String,
    tx: mpsc::UnboundedSender<Outbound>,
    subscriptions: Vec<(String, String)>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<u64, Session>,
    events: Vec<BrokerEvent>,
    next_message: u64,
}

impl State {
    fn message_frame(&mut self, subscription: &str, destination: &str, body: &str) -> String {
        self.next_message += 1;
        Frame::new(Command::Message)
            .header("subscription", subscription)
            .header("destination", destination)
            .header("message-id", &self.next_message.to_string())
            .header("content-type", "application/json")
            .with_body(body.to_string())
            .encode()
    }

    /// Sends `body` on every live subscription of `user`.
    fn deliver(&mut self, user: &str, body: &str) -> usize {
        let targets: Vec<_> = self
            .sessions
            .values()
            .filter(|s| s.user == user)
            .flat_map(|s| {
                s.subscriptions
                    .iter()
                    .map(|(id, dest)| (s.tx.clone(), id.clone(), dest.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        let mut delivered = 0;
        for (tx, id, dest) in targets {
            let frame = self.message_frame(&id, &dest, body);
            if tx.send(Outbound::Text(frame)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl MockBroker {
    pub async fn start() -> Self {
        Self::with_options(BrokerOptions::default()).await
    }

    pub async fn with_options(options: BrokerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            let mut next_conn = 0u64;
            while let Ok((stream, _)) = listener.accept().await {
                next_conn += 1;
                tokio::spawn(serve(stream, next_conn, accept_state.clone(), options.clone()));
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws-endpoint", self.addr)
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn count<F: Fn(&BrokerEvent) -> bool>(&self, pred: F) -> usize {
        self.state.lock().unwrap().events.iter().filter(|e| pred(e)).count()
    }

    /// Polls the event log until `pred` holds or [`WAIT`] elapses.
    pub async fn wait_for<F: Fn(&[BrokerEvent]) -> bool>(&self, pred: F) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if pred(&self.state.lock().unwrap().events) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits until `user` holds a live subscription.
    pub async fn wait_subscribed(&self, user: &str) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if self.subscription_ids(user).len() == 1 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn subscription_ids(&self, user: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| s.user == user)
            .flat_map(|s| s.subscriptions.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>())
            .collect()
    }

    pub fn sessions(&self, user: &str) -> usize {
        self.state.lock().unwrap().sessions.values().filter(|s| s.user == user).count()
    }

    /// Pushes a raw body to every live subscription of `user`.
    pub fn push(&self, user: &str, body: &str) -> usize {
        self.state.lock().unwrap().deliver(user, body)
    }

    /// Pushes a body tagged with an arbitrary subscription id.
    pub fn push_on(&self, user: &str, subscription: &str, body: &str) {
        let mut state = self.state.lock().unwrap();
        let txs: Vec<_> = state
            .sessions
            .values()
            .filter(|s| s.user == user)
            .map(|s| s.tx.clone())
            .collect();
        for tx in txs {
            let frame = state.message_frame(subscription, "/topic/messages", body);
            let _ = tx.send(Outbound::Text(frame));
        }
    }

    /// Drops every socket of `user` without a close handshake.
    pub fn kill(&self, user: &str) {
        let state = self.state.lock().unwrap();
        for session in state.sessions.values().filter(|s| s.user == user) {
            let _ = session.tx.send(Outbound::Kill);
        }
    }
}

async fn serve(stream: TcpStream, conn: u64, state: Arc<Mutex<State>>, options: BrokerOptions) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut user: Option<String> = None;

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Kill) | None => break,
            },
            incoming = source.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                    _ => break,
                };
                let (replies, stop) = handle(&text, conn, &mut user, &tx, &state, &options);
                for reply in replies {
                    let _ = sink.send(WsMessage::Text(reply)).await;
                }
                if stop {
                    break;
                }
            }
        }
    }

    let mut state = state.lock().unwrap();
    if let Some(session) = state.sessions.remove(&conn) {
        state.events.push(BrokerEvent::Closed { user: session.user });
    }
}

fn handle(
    text: &str,
    conn: u64,
    user: &mut Option<String>,
    tx: &mpsc::UnboundedSender<Outbound>,
    state: &Mutex<State>,
    options: &BrokerOptions,
) -> (Vec<String>, bool) {
    let mut replies = Vec::new();
    let Ok(frames) = stomp::decode(text) else {
        return (replies, false);
    };
    let mut state = state.lock().unwrap();

    if frames.is_empty() {
        if let Some(user) = user.as_ref() {
            state.events.push(BrokerEvent::Heartbeat { user: user.clone() });
        }
        return (replies, false);
    }

    for frame in frames {
        match frame.command {
            Command::Connect | Command::Stomp => {
                let token = frame
                    .get("Authorization")
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .unwrap_or_default()
                    .to_string();
                if token.is_empty() || token == REJECTED_TOKEN {
                    state.events.push(BrokerEvent::Rejected { token });
                    replies.push(Frame::new(Command::Error).header("message", "Bad credentials").encode());
                    return (replies, true);
                }
                state.sessions.insert(
                    conn,
                    Session {
                        user: token.clone(),
                        tx: tx.clone(),
                        subscriptions: Vec::new(),
                    },
                );
                state.events.push(BrokerEvent::Connected { user: token.clone() });
                *user = Some(token);
                replies.push(
                    Frame::new(Command::Connected)
                        .header("version", "1.2")
                        .header("heart-beat", &options.heartbeat)
                        .encode(),
                );
            }
            Command::Subscribe => {
                let id = frame.get("id").unwrap_or_default().to_string();
                let destination = frame.get("destination").unwrap_or_default().to_string();
                let Some(session) = state.sessions.get_mut(&conn) else {
                    continue;
                };
                session.subscriptions.push((id.clone(), destination.clone()));
                let user = session.user.clone();
                state.events.push(BrokerEvent::Subscribed { user, id, destination });
            }
            Command::Unsubscribe => {
                let id = frame.get("id").unwrap_or_default().to_string();
                let Some(session) = state.sessions.get_mut(&conn) else {
                    continue;
                };
                session.subscriptions.retain(|(sub, _)| *sub != id);
                let user = session.user.clone();
                state.events.push(BrokerEvent::Unsubscribed { user, id });
            }
            Command::Send => {
                let sender = user.clone().unwrap_or_default();
                let destination = frame.get("destination").unwrap_or_default().to_string();
                let body: Value = serde_json::from_str(&frame.body).unwrap_or(Value::Null);
                state.events.push(BrokerEvent::Sent {
                    user: sender.clone(),
                    destination,
                    body: body.clone(),
                });

                let envelope = json!({
                    "from": sender,
                    "text": body["content"],
                    "time": body["sentAt"],
                    "id": body["clientMessageId"],
                })
                .to_string();
                let receiver = body["receiverId"].as_str().unwrap_or_default().to_string();
                state.deliver(&receiver, &envelope);
                if options.echo_to_sender {
                    state.deliver(&sender, &envelope);
                }
            }
            Command::Disconnect => {
                if let Some(user) = user.as_ref() {
                    state.events.push(BrokerEvent::Disconnected { user: user.clone() });
                }
                return (replies, true);
            }
            _ => {}
        }
    }
    (replies, false)
}

/// Settings pointing at `broker` with a short retry delay.
pub fn settings(broker_url: &str) -> Settings {
    let mut settings = Settings::default();
    settings.broker.url = broker_url.to_string();
    settings.broker.reconnect_delay_ms = 50;
    settings.broker.connect_timeout_ms = 2000;
    settings
}

/// A URL on which nothing is listening.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/ws-endpoint", addr)
}

#[derive(Default)]
pub struct FakeHistory {
    pub summaries: Vec<Conversation>,
    pub messages: HashMap<String, Vec<Message>>,
    pub fail: bool,
}

#[async_trait]
impl HistoryService for FakeHistory {
    async fn conversation_summaries(&self) -> Result<Vec<Conversation>> {
        if self.fail {
            return Err(ChatError::History("HTTP 503".into()));
        }
        Ok(self.summaries.clone())
    }

    async fn messages(&self, peer_id: &str) -> Result<Vec<Message>> {
        if self.fail {
            return Err(ChatError::History("HTTP 503".into()));
        }
        Ok(self.messages.get(peer_id).cloned().unwrap_or_default())
    }
}

pub struct DeniedGeolocation;

#[async_trait]
impl GeolocationProvider for DeniedGeolocation {
    async fn current_position(&self, _options: &PositionOptions) -> std::result::Result<Location, GeolocationError> {
        Err(GeolocationError::PermissionDenied)
    }
}

/// Never answers; only the composer's timeout ends the lookup.
pub struct HangingGeolocation;

#[async_trait]
impl GeolocationProvider for HangingGeolocation {
    async fn current_position(&self, _options: &PositionOptions) -> std::result::Result<Location, GeolocationError> {
        std::future::pending().await
    }
}

/// Next engine event, or `None` after [`WAIT`].
pub async fn next_event(engine: &mut ChatEngine) -> Option<ClientEvent> {
    timeout(WAIT, engine.next_event()).await.ok().flatten()
}

/// Skips connection-state events until a message arrives.
pub async fn next_message(engine: &mut ChatEngine) -> Option<ClientEvent> {
    loop {
        match next_event(engine).await? {
            event @ ClientEvent::MessageReceived { .. } => return Some(event),
            ClientEvent::ConnectionChanged(_) => continue,
        }
    }
}

/// True if no message event shows up within `window`.
pub async fn quiet_for(engine: &mut ChatEngine, window: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, engine.next_event()).await {
            Err(_) => return true,
            Ok(Some(ClientEvent::MessageReceived { .. })) => return false,
            Ok(_) => continue,
        }
    }
}
