//! Single-slot inbound subscription on top of a [`SubscriptionTransport`].
//!
//! The router owns the one handler interested in the inbound channel and the
//! broker-side binding that feeds it. Bindings do not survive a reconnect, so
//! the owner of the transport must forward every state change through
//! [`SubscriptionRouter::handle_state`].

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, warn};

use crate::api::models::{ConnectionState, InboundEnvelope};
use crate::connection::{Delivery, SubscriptionTransport};

pub type Handler = Arc<dyn Fn(InboundEnvelope) + Send + Sync>;

struct Slot {
    generation: u64,
    handler: Handler,
}

#[derive(Default)]
struct RouterState {
    slot: Option<Slot>,
    /// Subscription id currently registered with the broker.
    bound: Option<String>,
    generation: u64,
    next_id: u64,
}

pub struct SubscriptionRouter {
    transport: Arc<dyn SubscriptionTransport>,
    destination: String,
    state: Mutex<RouterState>,
}

/// Returned by [`SubscriptionRouter::subscribe`]. Dropping it does nothing;
/// call [`Subscription::unsubscribe`] to release the slot.
#[derive(Debug)]
pub struct Subscription {
    router: Weak<SubscriptionRouter>,
    generation: u64,
}

impl Subscription {
    /// Clears the slot if it still holds the handler this token was issued
    /// for. A stale token leaves a newer handler alone.
    pub fn unsubscribe(self) {
        if let Some(router) = self.router.upgrade() {
            router.release(self.generation);
        }
    }
}

impl SubscriptionRouter {
    pub fn new(transport: Arc<dyn SubscriptionTransport>, destination: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            destination: destination.into(),
            state: Mutex::new(RouterState::default()),
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The broker-side subscription id, if one is live.
    pub fn binding(&self) -> Option<String> {
        self.lock().bound.clone()
    }

    pub fn has_handler(&self) -> bool {
        self.lock().slot.is_some()
    }

    /// Stores `handler` as the only active handler. When the transport is
    /// already connected the previous binding is replaced right away.
    pub fn subscribe<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(InboundEnvelope) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.generation += 1;
        let generation = state.generation;
        state.slot = Some(Slot {
            generation,
            handler: Arc::new(handler),
        });
        if self.transport.is_connected() {
            self.bind(&mut state);
        }

        Subscription {
            router: Arc::downgrade(self),
            generation,
        }
    }

    /// Reacts to a connection state change.
    pub fn handle_state(&self, connection: ConnectionState) {
        let mut state = self.lock();
        match connection {
            ConnectionState::Connected => {
                if state.slot.is_some() && state.bound.is_none() {
                    self.bind(&mut state);
                }
            }
            ConnectionState::Disconnected => {
                if let Some(id) = state.bound.take() {
                    debug!("Binding {} ended with the connection", id);
                }
            }
            ConnectionState::Connecting => {}
        }
    }

    /// Hands one inbound frame to the handler.
    pub fn deliver(&self, delivery: Delivery) {
        let handler = {
            let state = self.lock();
            if state.bound.as_deref() != Some(delivery.subscription.as_str()) {
                debug!(
                    "Dropping frame for inactive subscription {:?}",
                    delivery.subscription
                );
                return;
            }
            match &state.slot {
                Some(slot) => slot.handler.clone(),
                None => return,
            }
        };

        match serde_json::from_str::<InboundEnvelope>(&delivery.body) {
            Ok(envelope) if envelope.from.trim().is_empty() => {
                warn!("Dropping envelope without a sender on {}", self.destination)
            }
            Ok(envelope) => handler(envelope),
            Err(e) => warn!("Dropping malformed envelope on {}: {}", self.destination, e),
        }
    }

    fn bind(&self, state: &mut RouterState) {
        if let Some(old) = state.bound.take() {
            if let Err(e) = self.transport.unsubscribe(&old) {
                warn!("Failed to release subscription {}: {}", old, e);
            }
        }

        let id = format!("sub-{}", state.next_id);
        state.next_id += 1;
        match self.transport.subscribe(&id, &self.destination) {
            Ok(()) => {
                info!("Subscribed to {} as {}", self.destination, id);
                state.bound = Some(id);
            }
            Err(e) => warn!("Subscribing to {} failed: {}", self.destination, e),
        }
    }

    fn release(&self, generation: u64) {
        let mut state = self.lock();
        if state.slot.as_ref().map(|slot| slot.generation) != Some(generation) {
            return;
        }
        state.slot = None;
        if let Some(id) = state.bound.take() {
            if let Err(e) = self.transport.unsubscribe(&id) {
                debug!("Unsubscribe of {} not sent: {}", id, e);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
