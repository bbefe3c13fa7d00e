//! Outbound message path: validate, locate, publish, then record locally.

use std::sync::Arc;

use log::{debug, warn};
use uuid::Uuid;

use crate::api::models::{Location, Message, OutboundPayload};
use crate::connection::ConnectionManager;
use crate::error::{ChatError, Result};
use crate::geo::{GeolocationError, GeolocationProvider, PositionOptions};
use crate::store::ConversationStore;
use crate::utils;

pub struct MessageComposer {
    connection: Arc<ConnectionManager>,
    geolocation: Arc<dyn GeolocationProvider>,
    options: PositionOptions,
}

impl MessageComposer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        geolocation: Arc<dyn GeolocationProvider>,
        options: PositionOptions,
    ) -> Self {
        Self {
            connection,
            geolocation,
            options,
        }
    }

    /// Sends `content` to `peer_id` and records it in `store`.
    ///
    /// The timestamp is taken before anything else so it reflects when the
    /// user hit send. The store is only touched once the broker connection
    /// has accepted the frame.
    pub async fn send(&self, store: &mut ConversationStore, peer_id: &str, content: &str) -> Result<Message> {
        let sent_at = utils::now_millis();
        let peer_id = peer_id.trim();
        let content = content.trim();
        if peer_id.is_empty() {
            return Err(ChatError::Validation("recipient is required".into()));
        }
        if content.is_empty() {
            return Err(ChatError::Validation("message content is empty".into()));
        }
        if !self.connection.is_connected() {
            return Err(ChatError::NotConnected);
        }

        let payload = OutboundPayload {
            receiver_id: peer_id.to_string(),
            sent_at,
            content: content.to_string(),
            location: self.locate().await,
            client_message_id: Some(Uuid::new_v4().to_string()),
        };
        self.connection.publish(&payload)?;

        let message = Message::outgoing(store.me(), &payload);
        store.append_optimistic(message.clone());
        debug!("Sent message to {}", peer_id);
        Ok(message)
    }

    /// Best-effort position. Never fails the send.
    async fn locate(&self) -> Option<Location> {
        let lookup = self.geolocation.current_position(&self.options);
        let result = match tokio::time::timeout(self.options.timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(GeolocationError::Timeout),
        };
        match result {
            Ok(location) => Some(location),
            Err(e) => {
                warn!("Sending without location: {}", e);
                None
            }
        }
    }
}
