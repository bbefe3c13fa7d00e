//! Real-time sync engine for a one-to-one chat client.
//!
//! [`ChatEngine`] keeps a STOMP-over-WebSocket session to the message broker
//! alive, reconciles inbound envelopes and optimistic sends into an
//! in-memory [`ConversationStore`], and raises transient alerts through the
//! [`NotificationDispatcher`].

pub mod api;
pub mod auth;
pub mod composer;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod geo;
pub mod notify;
pub mod router;
pub mod stomp;
pub mod store;
pub mod utils;

pub use api::client::{HistoryService, HttpHistoryService};
pub use api::events::ClientEvent;
pub use api::models::{Conversation, ConnectionState, InboundEnvelope, Location, Message, OutboundPayload};
pub use auth::{AuthProvider, JwtAuthProvider, StaticToken};
pub use config::Settings;
pub use connection::ConnectionManager;
pub use engine::ChatEngine;
pub use error::{ChatError, Result};
pub use geo::{FixedPosition, GeolocationProvider, NoGeolocation, PositionOptions};
pub use notify::{Notification, NotificationDispatcher};
pub use router::SubscriptionRouter;
pub use store::ConversationStore;
