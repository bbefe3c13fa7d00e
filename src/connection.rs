//! Broker connection lifecycle.
//!
//! A [`ConnectionManager`] owns one background worker per `connect()` call.
//! The worker holds the WebSocket, performs the STOMP handshake, pumps
//! frames in both directions, keeps heart-beats going and, after an
//! unexpected close, retries after a fixed delay. Callers only ever see the
//! retry as repeated state-change events.
//!
//! Every worker is tagged with an epoch. `disconnect()` and a new
//! `connect()` bump the epoch, after which the old worker can no longer
//! publish state changes or deliveries.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::api::models::{ConnectionState, OutboundPayload};
use crate::config::BrokerSettings;
use crate::error::{ChatError, Result};
use crate::stomp::{self, Command, Frame, Heartbeat};
use crate::utils;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// A `MESSAGE` frame as it leaves the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub subscription: String,
    pub destination: Option<String>,
    pub body: String,
}

/// What the subscription router needs from a transport.
pub trait SubscriptionTransport: Send + Sync {
    fn is_connected(&self) -> bool;
    fn subscribe(&self, id: &str, destination: &str) -> Result<()>;
    fn unsubscribe(&self, id: &str) -> Result<()>;
}

enum Outgoing {
    Frame(Frame),
    Shutdown,
}

struct Worker {
    tx: mpsc::UnboundedSender<Outgoing>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    epoch: u64,
}

#[derive(Default)]
struct Shared {
    inner: Mutex<Inner>,
    // Serialises "change state, then notify" so observers see transitions
    // in the order they happened.
    gate: Mutex<()>,
    observer: Mutex<Option<StateCallback>>,
    delivery: Mutex<Option<DeliveryCallback>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    fn is_current(&self, epoch: u64) -> bool {
        lock(&self.inner).epoch == epoch
    }

    fn begin_epoch(&self) -> u64 {
        let mut inner = lock(&self.inner);
        inner.epoch += 1;
        inner.epoch
    }

    /// Applies a transition reported by the worker of `epoch`. Returns
    /// `false` once that worker has been superseded.
    fn transition(&self, epoch: u64, next: ConnectionState) -> bool {
        let _gate = lock(&self.gate);
        {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch {
                return false;
            }
            if inner.state == next {
                return true;
            }
            inner.state = next;
        }
        self.notify(next);
        true
    }

    /// Retires the current worker and lands in `Disconnected`.
    fn force_disconnected(&self) {
        let _gate = lock(&self.gate);
        let changed = {
            let mut inner = lock(&self.inner);
            inner.epoch += 1;
            let changed = inner.state != ConnectionState::Disconnected;
            inner.state = ConnectionState::Disconnected;
            changed
        };
        if changed {
            self.notify(ConnectionState::Disconnected);
        }
    }

    fn notify(&self, state: ConnectionState) {
        let observer = lock(&self.observer).clone();
        if let Some(observer) = observer {
            observer(state);
        }
    }

    fn deliver(&self, epoch: u64, delivery: Delivery) {
        if !self.is_current(epoch) {
            return;
        }
        let handler = lock(&self.delivery).clone();
        match handler {
            Some(handler) => handler(delivery),
            None => debug!(
                "No delivery handler installed; dropping frame for subscription {}",
                delivery.subscription
            ),
        }
    }
}

pub struct ConnectionManager {
    settings: BrokerSettings,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl ConnectionManager {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            shared: Arc::new(Shared::default()),
            worker: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Installs the single state observer, replacing any previous one.
    ///
    /// The observer runs on the connection worker. It must not call
    /// `connect()` or `disconnect()` synchronously.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        *lock(&self.shared.observer) = Some(Arc::new(callback));
    }

    /// Installs the handler receiving every inbound `MESSAGE` frame.
    pub fn set_delivery_handler<F>(&self, handler: F)
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        *lock(&self.shared.delivery) = Some(Arc::new(handler));
    }

    /// Opens the broker session. Resolves once the broker accepted the
    /// STOMP handshake.
    ///
    /// A failed first attempt is reported as [`ChatError::Transport`], but
    /// the worker keeps retrying in the background until `disconnect()`.
    pub async fn connect(&self, token: &str) -> Result<()> {
        if token.trim().is_empty() {
            return Err(ChatError::Auth("a bearer token is required to connect".into()));
        }
        let endpoint = utils::broker_endpoint(&self.settings.url, token)?;

        // A second connect replaces the first rather than running beside it.
        self.disconnect();

        let epoch = self.shared.begin_epoch();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        *lock(&self.worker) = Some(Worker { tx });

        let session = Session {
            settings: self.settings.clone(),
            endpoint,
            token: token.to_string(),
            epoch,
            shared: self.shared.clone(),
        };
        tokio::spawn(session.run(rx, ready_tx));

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Transport(
                "connection worker exited before the handshake finished".into(),
            )),
        }
    }

    /// Closes the session and cancels any pending retry. Safe to call at any
    /// time, any number of times.
    pub fn disconnect(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            let _ = worker.tx.send(Outgoing::Shutdown);
        }
        self.shared.force_disconnected();
    }

    /// Hands an outbound message to the broker.
    pub fn publish(&self, payload: &OutboundPayload) -> Result<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        let body = serde_json::to_string(payload)?;
        self.enqueue(Frame::send(&self.settings.publish_destination, body))
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        let worker = lock(&self.worker);
        let worker = worker.as_ref().ok_or(ChatError::NotConnected)?;
        worker
            .tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| ChatError::NotConnected)
    }
}

impl SubscriptionTransport for ConnectionManager {
    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }

    fn subscribe(&self, id: &str, destination: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        self.enqueue(Frame::subscribe(id, destination))
    }

    fn unsubscribe(&self, id: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        self.enqueue(Frame::unsubscribe(id))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            let _ = worker.tx.send(Outgoing::Shutdown);
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Session {
    settings: BrokerSettings,
    endpoint: Url,
    token: String,
    epoch: u64,
    shared: Arc<Shared>,
}

impl Session {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Outgoing>, ready: oneshot::Sender<Result<()>>) {
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;

        loop {
            if !self.shared.transition(self.epoch, ConnectionState::Connecting) {
                return;
            }
            attempt += 1;

            match self.establish().await {
                Ok((mut ws, heartbeat)) => {
                    if !self.shared.transition(self.epoch, ConnectionState::Connected) {
                        let _ = ws.close(None).await;
                        return;
                    }
                    info!(
                        "Connected to broker at {} (heart-beat out={:?} in={:?})",
                        self.display_endpoint(),
                        heartbeat.outgoing,
                        heartbeat.incoming
                    );
                    attempt = 0;
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }

                    match self.pump(ws, heartbeat, &mut rx).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Lost(reason) => {
                            warn!("Connection to broker lost: {}", reason);
                            self.shared.transition(self.epoch, ConnectionState::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    self.shared.transition(self.epoch, ConnectionState::Disconnected);
                    match ready.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(e));
                        }
                        None => warn!("Reconnect attempt {} failed: {}", attempt, e),
                    }
                }
            }

            let delay = self.settings.reconnect_delay();
            if delay.is_zero() {
                info!("Automatic reconnect disabled; staying disconnected");
                return;
            }
            info!("Reconnecting to broker in {:?}", delay);
            if !wait_for_retry(delay, &mut rx).await {
                return;
            }
        }
    }

    fn display_endpoint(&self) -> String {
        // The query string carries the bearer token.
        format!(
            "{}://{}{}",
            self.endpoint.scheme(),
            self.endpoint.host_str().unwrap_or_default(),
            self.endpoint.path()
        )
    }

    async fn establish(&self) -> Result<(WsStream, Heartbeat)> {
        let timeout = self.settings.connect_timeout();
        match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Transport(format!(
                "handshake with {} timed out after {:?}",
                self.display_endpoint(),
                timeout
            ))),
        }
    }

    async fn handshake(&self) -> Result<(WsStream, Heartbeat)> {
        debug!("Opening WebSocket to {}", self.display_endpoint());
        let (mut ws, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| ChatError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let host = self.endpoint.host_str().unwrap_or("localhost").to_string();
        let offer = self.settings.heartbeat();
        send_frame(&mut ws, &Frame::connect(&host, &self.token, offer)).await?;

        loop {
            let message = match ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    return Err(ChatError::Transport(format!("handshake failed: {}", e)));
                }
                None => {
                    return Err(ChatError::Transport(
                        "broker closed the connection during the handshake".into(),
                    ));
                }
            };
            let text = match message {
                WsMessage::Text(text) => text,
                WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                WsMessage::Close(_) => {
                    return Err(ChatError::Transport(
                        "broker closed the connection during the handshake".into(),
                    ));
                }
                _ => continue,
            };

            let frames = stomp::decode(&text)
                .map_err(|e| ChatError::Transport(format!("malformed handshake reply: {}", e)))?;
            for frame in frames {
                match frame.command {
                    Command::Connected => {
                        let server = frame
                            .get("heart-beat")
                            .and_then(Heartbeat::parse)
                            .unwrap_or_default();
                        return Ok((ws, offer.negotiate(&server)));
                    }
                    Command::Error => {
                        let reason = frame.get("message").unwrap_or("connection refused");
                        return Err(ChatError::Transport(format!("STOMP error: {}", reason)));
                    }
                    other => debug!("Ignoring {} frame before CONNECTED", other),
                }
            }
        }
    }

    async fn pump(
        &self,
        mut ws: WsStream,
        heartbeat: Heartbeat,
        rx: &mut mpsc::UnboundedReceiver<Outgoing>,
    ) -> SessionEnd {
        let beat_every = heartbeat.outgoing;
        // Allow one missed beat before declaring the broker gone.
        let silence_limit = heartbeat.incoming * 2;
        let mut next_beat = Instant::now() + beat_every;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Outgoing::Frame(frame)) => {
                        if let Err(e) = send_frame(&mut ws, &frame).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                        next_beat = Instant::now() + beat_every;
                    }
                    Some(Outgoing::Shutdown) | None => {
                        let _ = send_frame(&mut ws, &Frame::disconnect()).await;
                        let _ = ws.close(None).await;
                        info!("Disconnected from broker");
                        return SessionEnd::Shutdown;
                    }
                },

                incoming = ws.next() => {
                    last_seen = Instant::now();
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(reason) = self.handle_text(&text) {
                                return SessionEnd::Lost(reason);
                            }
                        }
                        Some(Ok(WsMessage::Binary(bytes))) => {
                            if let Some(reason) = self.handle_text(&String::from_utf8_lossy(&bytes)) {
                                return SessionEnd::Lost(reason);
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("closed by broker: {}", f.reason))
                                .unwrap_or_else(|| "closed by broker".to_string());
                            return SessionEnd::Lost(reason);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                        None => return SessionEnd::Lost("stream ended".to_string()),
                    }
                },

                _ = tokio::time::sleep_until(next_beat), if !beat_every.is_zero() => {
                    if let Err(e) = ws.send(WsMessage::Text("\n".to_string())).await {
                        return SessionEnd::Lost(format!("heart-beat failed: {}", e));
                    }
                    next_beat = Instant::now() + beat_every;
                },

                _ = tokio::time::sleep_until(last_seen + silence_limit), if !silence_limit.is_zero() => {
                    return SessionEnd::Lost(format!("no heart-beat from broker for {:?}", silence_limit));
                },
            }
        }
    }

    /// Routes decoded frames. Returns a reason when the session must end.
    fn handle_text(&self, text: &str) -> Option<String> {
        let (frames, errors) = stomp::decode_lenient(text);
        for e in errors {
            warn!("Dropping malformed frame from broker: {}", e);
        }

        for frame in frames {
            match frame.command {
                Command::Message => {
                    let subscription = frame.get("subscription").unwrap_or_default().to_string();
                    let destination = frame.get("destination").map(str::to_string);
                    self.shared.deliver(
                        self.epoch,
                        Delivery {
                            subscription,
                            destination,
                            body: frame.body,
                        },
                    );
                }
                Command::Receipt => {
                    debug!("Receipt {}", frame.get("receipt-id").unwrap_or_default());
                }
                Command::Error => {
                    let reason = frame.get("message").unwrap_or("unspecified").to_string();
                    error!("Broker error: {} {}", reason, frame.body.trim());
                    return Some(format!("broker error: {}", reason));
                }
                other => debug!("Ignoring unexpected {} frame", other),
            }
        }
        None
    }
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<()> {
    ws.send(WsMessage::Text(frame.encode()))
        .await
        .map_err(|e| ChatError::Transport(format!("failed to send {} frame: {}", frame.command, e)))
}

/// Sleeps out the reconnect delay. Returns `false` if the manager asked the
/// worker to stop meanwhile.
async fn wait_for_retry(delay: Duration, rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = rx.recv() => match cmd {
                Some(Outgoing::Frame(frame)) => {
                    debug!("Dropping {} frame queued while disconnected", frame.command);
                }
                Some(Outgoing::Shutdown) | None => return false,
            },
        }
    }
}
