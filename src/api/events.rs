use crate::api::models::{ConnectionState, Message};
use crate::notify::Notification;

/// What the engine reports back to the UI after applying a transport signal.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    MessageReceived {
        peer_id: String,
        message: Message,
        notification: Notification,
        /// A conversation was created for a previously unknown peer.
        created: bool,
        /// The message landed in the open conversation's list.
        appended: bool,
    },
}
