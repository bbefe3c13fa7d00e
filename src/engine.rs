//! Composition root of the sync engine.
//!
//! The connection worker never touches the store. It queues signals which
//! [`ChatEngine::next_event`] applies on the caller's task, so every store
//! mutation happens in one place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::api::client::HistoryService;
use crate::api::events::ClientEvent;
use crate::api::models::{ConnectionState, InboundEnvelope, Message};
use crate::auth::AuthProvider;
use crate::composer::MessageComposer;
use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::error::{ChatError, Result};
use crate::geo::GeolocationProvider;
use crate::notify::NotificationDispatcher;
use crate::router::{Subscription, SubscriptionRouter};
use crate::store::{ConversationStore, Merge};
use crate::utils;

enum Signal {
    State(ConnectionState),
    Inbound {
        envelope: InboundEnvelope,
        received_at: DateTime<Utc>,
    },
}

pub struct ChatEngine {
    auth: Arc<dyn AuthProvider>,
    history: Arc<dyn HistoryService>,
    connection: Arc<ConnectionManager>,
    router: Arc<SubscriptionRouter>,
    composer: MessageComposer,
    store: ConversationStore,
    notifications: NotificationDispatcher,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signals: mpsc::UnboundedReceiver<Signal>,
    subscription: Option<Subscription>,
}

impl ChatEngine {
    pub fn new(
        settings: &Settings,
        me: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
        history: Arc<dyn HistoryService>,
        geolocation: Arc<dyn GeolocationProvider>,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(settings.broker.clone()));
        let router = SubscriptionRouter::new(connection.clone(), settings.broker.subscribe_destination.clone());
        let (signal_tx, signals) = mpsc::unbounded_channel();

        let weak = Arc::downgrade(&router);
        let tx = signal_tx.clone();
        connection.on_state_change(move |state| {
            // Rebind before anyone else hears about the new session.
            if let Some(router) = weak.upgrade() {
                router.handle_state(state);
            }
            let _ = tx.send(Signal::State(state));
        });

        let weak = Arc::downgrade(&router);
        connection.set_delivery_handler(move |delivery| {
            if let Some(router) = weak.upgrade() {
                router.deliver(delivery);
            }
        });

        let composer = MessageComposer::new(connection.clone(), geolocation, settings.geolocation.options());
        let notifications = NotificationDispatcher::new(
            settings.notifications.visible_for(),
            settings.notifications.fade_for(),
        );

        Self {
            auth,
            history,
            connection,
            router,
            composer,
            store: ConversationStore::new(me),
            notifications,
            signal_tx,
            signals,
            subscription: None,
        }
    }

    pub fn me(&self) -> &str {
        self.store.me()
    }

    /// Connects with the auth provider's token. A missing or expired token
    /// fails with [`ChatError::Auth`] and is not retried.
    pub async fn connect(&mut self) -> Result<()> {
        let token = self
            .auth
            .token()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ChatError::Auth("no session token available".into()))?;
        if !self.auth.is_authenticated() {
            return Err(ChatError::Auth("session token is invalid or expired".into()));
        }

        if self.subscription.is_none() {
            let tx = self.signal_tx.clone();
            self.subscription = Some(self.router.subscribe(move |envelope| {
                let _ = tx.send(Signal::Inbound {
                    envelope,
                    received_at: utils::now_millis(),
                });
            }));
        }

        info!("Connecting as {}", self.me());
        self.connection.connect(&token).await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Waits for the next transport signal that changes something and
    /// applies it. Duplicates and self-echoes are absorbed silently.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            let signal = self.signals.recv().await?;
            if let Some(event) = self.apply(signal) {
                return Some(event);
            }
        }
    }

    fn apply(&mut self, signal: Signal) -> Option<ClientEvent> {
        match signal {
            Signal::State(state) => Some(ClientEvent::ConnectionChanged(state)),
            Signal::Inbound { envelope, received_at } => match self.store.merge_inbound(&envelope, received_at) {
                Merge::Applied {
                    peer_id,
                    created,
                    appended,
                    message,
                } => {
                    let display_name = self.store.display_name(&peer_id);
                    let notification = self.notifications.on_inbound(&envelope, &display_name, Instant::now());
                    Some(ClientEvent::MessageReceived {
                        peer_id,
                        message,
                        notification,
                        created,
                        appended,
                    })
                }
                Merge::Duplicate | Merge::SelfEcho | Merge::Rejected => None,
            },
        }
    }

    /// Seeds the store with the history service's conversation list.
    pub async fn bootstrap(&mut self) -> Result<usize> {
        let summaries = self.history.conversation_summaries().await?;
        let created = self.store.bootstrap(summaries);
        info!("Loaded {} conversations ({} new)", self.store.len(), created);
        Ok(created)
    }

    /// Focuses `peer_id` and replaces its message list with durable history.
    pub async fn open_conversation(&mut self, peer_id: &str) -> Result<()> {
        let peer_id = peer_id.trim();
        if peer_id.is_empty() {
            return Err(ChatError::Validation("peer id is required".into()));
        }
        self.store.open(peer_id);
        let messages = self.history.messages(peer_id).await?;
        self.store.load_history(peer_id, messages);
        Ok(())
    }

    pub async fn send(&mut self, peer_id: &str, content: &str) -> Result<Message> {
        self.composer.send(&mut self.store, peer_id, content).await
    }

    /// Opens a conversation with a possibly new peer and sends the first
    /// message into it.
    pub async fn start_conversation(&mut self, peer_id: &str, content: &str) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation("message content is empty".into()));
        }
        if let Err(e) = self.open_conversation(peer_id).await {
            match e {
                ChatError::History(_) => warn!("Starting conversation without history: {}", e),
                other => return Err(other),
            }
        }
        self.send(peer_id, content).await
    }

    /// Handles a click on an alert: opens the sender's conversation.
    /// Returns the peer, or `None` when the alert is already gone.
    pub async fn activate_notification(&mut self, id: u64) -> Result<Option<String>> {
        let Some(peer_id) = self.notifications.click(id) else {
            return Ok(None);
        };
        self.store.get_or_create(&peer_id);
        self.open_conversation(&peer_id).await?;
        Ok(Some(peer_id))
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ConversationStore {
        &mut self.store
    }

    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.notifications
    }

    pub fn notifications_mut(&mut self) -> &mut NotificationDispatcher {
        &mut self.notifications
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.connection.disconnect();
    }
}
