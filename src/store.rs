//! In-memory conversation model.
//!
//! Summaries are kept for every peer seen during the session. The full
//! message list is kept only for the conversation that is currently open;
//! focusing another peer evicts it.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::api::models::{Conversation, InboundEnvelope, Message};

const SEEN_ID_CAPACITY: usize = 1024;

/// Outcome of [`ConversationStore::merge_inbound`].
#[derive(Debug, Clone, PartialEq)]
pub enum Merge {
    Applied {
        peer_id: String,
        created: bool,
        appended: bool,
        message: Message,
    },
    /// The envelope's id was already merged or sent from here.
    Duplicate,
    /// The envelope was sent by the local user.
    SelfEcho,
    /// The envelope names no sender.
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenConversation {
    pub peer_id: String,
    pub messages: Vec<Message>,
}

struct Entry {
    conversation: Conversation,
    order: u64,
}

/// Bounded memory of message ids, oldest forgotten first.
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` if the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

pub struct ConversationStore {
    me: String,
    entries: HashMap<String, Entry>,
    next_order: u64,
    open: Option<OpenConversation>,
    seen: SeenIds,
}

impl ConversationStore {
    pub fn new(me: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            entries: HashMap::new(),
            next_order: 0,
            open: None,
            seen: SeenIds::new(SEEN_ID_CAPACITY),
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies one inbound envelope. `received_at` stands in for a missing
    /// envelope time.
    pub fn merge_inbound(&mut self, envelope: &InboundEnvelope, received_at: DateTime<Utc>) -> Merge {
        if envelope.from.trim().is_empty() {
            warn!("Dropping envelope without a sender");
            return Merge::Rejected;
        }
        if envelope.from == self.me {
            debug!("Ignoring echo of our own message");
            return Merge::SelfEcho;
        }
        if let Some(id) = &envelope.id {
            if !self.seen.insert(id) {
                debug!("Ignoring duplicate message {}", id);
                return Merge::Duplicate;
            }
        }

        let message = Message::inbound(&self.me, envelope, received_at);
        let peer_id = envelope.from.clone();
        let created = self.record(&peer_id, &message);
        let appended = self.append_if_open(&peer_id, &message);

        Merge::Applied {
            peer_id,
            created,
            appended,
            message,
        }
    }

    /// Records a message we just sent. Never rejected. Returns the peer.
    pub fn append_optimistic(&mut self, message: Message) -> String {
        let peer_id = message.peer_of(&self.me).to_string();
        if let Some(id) = &message.id {
            self.seen.insert(id);
        }
        self.record(&peer_id, &message);
        self.append_if_open(&peer_id, &message);
        peer_id
    }

    /// Replaces the open conversation's list with fetched history. Returns
    /// `false` and changes nothing when `peer_id` is no longer open.
    pub fn load_history(&mut self, peer_id: &str, messages: Vec<Message>) -> bool {
        match &mut self.open {
            Some(open) if open.peer_id == peer_id => {
                for id in messages.iter().filter_map(|m| m.id.as_deref()) {
                    self.seen.insert(id);
                }
                open.messages = messages;
                true
            }
            _ => {
                warn!("Discarding history for {}: conversation is no longer open", peer_id);
                false
            }
        }
    }

    /// Focuses `peer_id`, creating its conversation if needed and clearing
    /// its unread count. Returns `true` if the conversation was created.
    pub fn open(&mut self, peer_id: &str) -> bool {
        let created = self.ensure(peer_id);
        if let Some(entry) = self.entries.get_mut(peer_id) {
            entry.conversation.unread_count = 0;
        }
        let already_open = self.open_peer() == Some(peer_id);
        if !already_open {
            self.open = Some(OpenConversation {
                peer_id: peer_id.to_string(),
                messages: Vec::new(),
            });
        }
        created
    }

    /// Defocuses the open conversation and drops its message list.
    pub fn close(&mut self) {
        self.open = None;
    }

    /// Merges summaries from the history service. Returns how many
    /// conversations were new.
    pub fn bootstrap(&mut self, summaries: Vec<Conversation>) -> usize {
        let mut created = 0;
        for summary in summaries {
            if summary.peer_id.is_empty() || summary.peer_id == self.me {
                continue;
            }
            match self.entries.get_mut(&summary.peer_id) {
                Some(entry) => {
                    let current = &mut entry.conversation;
                    if current.has_placeholder_name() && !summary.has_placeholder_name() {
                        current.display_name = summary.display_name;
                    }
                    if summary.last_message_at > current.last_message_at {
                        current.last_message = summary.last_message;
                        current.last_message_at = summary.last_message_at;
                    }
                    // The open conversation stays read.
                    let is_open = self.open.as_ref().is_some_and(|open| open.peer_id == summary.peer_id);
                    if !is_open {
                        current.unread_count = summary.unread_count;
                    }
                }
                None => {
                    let order = self.next_order();
                    let mut conversation = summary;
                    if conversation.display_name.is_empty() {
                        conversation.display_name = conversation.peer_id.clone();
                    }
                    self.entries.insert(
                        conversation.peer_id.clone(),
                        Entry { conversation, order },
                    );
                    created += 1;
                }
            }
        }
        created
    }

    /// Directory backfill for a placeholder name.
    pub fn set_display_name(&mut self, peer_id: &str, name: &str) -> bool {
        match self.entries.get_mut(peer_id) {
            Some(entry) if !name.trim().is_empty() => {
                entry.conversation.display_name = name.trim().to_string();
                true
            }
            _ => false,
        }
    }

    pub fn get_or_create(&mut self, peer_id: &str) -> &Conversation {
        self.ensure(peer_id);
        &self.entries[peer_id].conversation
    }

    pub fn conversation(&self, peer_id: &str) -> Option<&Conversation> {
        self.entries.get(peer_id).map(|entry| &entry.conversation)
    }

    /// Most recent first. Conversations without messages sort last; ties
    /// go to the one created later.
    pub fn conversations(&self) -> Vec<&Conversation> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.conversation
                .last_message_at
                .cmp(&a.conversation.last_message_at)
                .then(b.order.cmp(&a.order))
        });
        entries.into_iter().map(|entry| &entry.conversation).collect()
    }

    pub fn open_conversation(&self) -> Option<&OpenConversation> {
        self.open.as_ref()
    }

    pub fn open_peer(&self) -> Option<&str> {
        self.open.as_ref().map(|open| open.peer_id.as_str())
    }

    /// Messages of the open conversation; empty when nothing is open.
    pub fn messages(&self) -> &[Message] {
        self.open.as_ref().map(|open| open.messages.as_slice()).unwrap_or(&[])
    }

    pub fn display_name(&self, peer_id: &str) -> String {
        self.conversation(peer_id)
            .map(|c| c.display_name.clone())
            .unwrap_or_else(|| peer_id.to_string())
    }

    fn next_order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }

    fn ensure(&mut self, peer_id: &str) -> bool {
        if self.entries.contains_key(peer_id) {
            return false;
        }
        let order = self.next_order();
        self.entries.insert(
            peer_id.to_string(),
            Entry {
                conversation: Conversation::placeholder(peer_id),
                order,
            },
        );
        true
    }

    /// Updates the peer's summary in one step. Returns `true` if the
    /// conversation was created.
    fn record(&mut self, peer_id: &str, message: &Message) -> bool {
        let created = self.ensure(peer_id);
        if let Some(entry) = self.entries.get_mut(peer_id) {
            entry.conversation.last_message = Some(message.content.clone());
            entry.conversation.last_message_at = Some(message.sent_at);
        }
        created
    }

    fn append_if_open(&mut self, peer_id: &str, message: &Message) -> bool {
        match &mut self.open {
            Some(open) if open.peer_id == peer_id => {
                open.messages.push(message.clone());
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn envelope(from: &str, text: &str, time: Option<DateTime<Utc>>) -> InboundEnvelope {
        InboundEnvelope {
            from: from.into(),
            text: text.into(),
            time,
            id: None,
        }
    }

    fn sent(to: &str, content: &str, when: DateTime<Utc>, id: Option<&str>) -> Message {
        Message {
            id: id.map(str::to_string),
            sender_id: "me".into(),
            receiver_id: to.into(),
            content: content.into(),
            sent_at: when,
            location: None,
        }
    }

    #[test]
    fn test_merge_creates_conversation_once() {
        let mut store = ConversationStore::new("me");
        let merge = store.merge_inbound(&envelope("p", "hi", Some(at(1))), at(99));

        match merge {
            Merge::Applied { peer_id, created, appended, .. } => {
                assert_eq!(peer_id, "p");
                assert!(created);
                assert!(!appended);
            }
            other => panic!("unexpected merge result {:?}", other),
        }
        assert_eq!(store.len(), 1);
        let conv = store.conversation("p").unwrap();
        assert_eq!(conv.last_message.as_deref(), Some("hi"));
        assert_eq!(conv.last_message_at, Some(at(1)));
        assert_eq!(conv.display_name, "p");
        assert_eq!(conv.unread_count, 0);

        store.merge_inbound(&envelope("p", "again", Some(at(2))), at(99));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_merge_without_time_uses_receipt_time() {
        let mut store = ConversationStore::new("me");
        store.merge_inbound(&envelope("p", "hi", None), at(42));
        assert_eq!(store.conversation("p").unwrap().last_message_at, Some(at(42)));
    }

    #[test]
    fn test_merge_appends_only_for_open_peer() {
        let mut store = ConversationStore::new("me");
        store.open("p");

        store.merge_inbound(&envelope("p", "one", Some(at(1))), at(1));
        store.merge_inbound(&envelope("q", "two", Some(at(2))), at(2));

        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.messages()[0].content, "one");
        assert_eq!(store.messages()[0].receiver_id, "me");
        assert_eq!(store.conversation("q").unwrap().last_message.as_deref(), Some("two"));
    }

    #[test]
    fn test_duplicate_and_self_echo_are_ignored() {
        let mut store = ConversationStore::new("me");
        store.open("p");

        let mut env = envelope("p", "hi", Some(at(1)));
        env.id = Some("m-1".into());
        assert!(matches!(store.merge_inbound(&env, at(1)), Merge::Applied { .. }));
        assert_eq!(store.merge_inbound(&env, at(1)), Merge::Duplicate);

        assert_eq!(
            store.merge_inbound(&envelope("me", "echo", None), at(2)),
            Merge::SelfEcho
        );
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn test_envelope_without_sender_is_rejected() {
        let mut store = ConversationStore::new("me");
        assert_eq!(store.merge_inbound(&envelope("", "x", None), at(1)), Merge::Rejected);
        assert_eq!(store.merge_inbound(&envelope("  ", "x", None), at(1)), Merge::Rejected);
        assert!(store.is_empty());
        assert!(store.conversation("").is_none());
    }

    #[test]
    fn test_echo_of_optimistic_message_is_duplicate() {
        let mut store = ConversationStore::new("me");
        store.append_optimistic(sent("p", "x", at(1), Some("c-1")));

        let mut echo = envelope("p", "x", Some(at(1)));
        echo.id = Some("c-1".into());
        assert_eq!(store.merge_inbound(&echo, at(2)), Merge::Duplicate);
    }

    #[test]
    fn test_optimistic_append_updates_summary_and_open_list() {
        let mut store = ConversationStore::new("me");
        assert_eq!(store.append_optimistic(sent("p", "bg", at(1), None)), "p");
        assert_eq!(store.conversation("p").unwrap().last_message.as_deref(), Some("bg"));
        assert!(store.messages().is_empty());

        store.open("p");
        store.append_optimistic(sent("p", "fg", at(2), None));
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.conversation("p").unwrap().last_message_at, Some(at(2)));
    }

    #[test]
    fn test_load_history_replaces_wholesale() {
        let mut store = ConversationStore::new("me");
        store.open("p");
        store.append_optimistic(sent("p", "local", at(5), None));

        let history = vec![sent("p", "a", at(1), None), sent("p", "b", at(2), None)];
        assert!(store.load_history("p", history));
        let contents: Vec<_> = store.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
    }

    #[test]
    fn test_load_history_for_closed_peer_is_discarded() {
        let mut store = ConversationStore::new("me");
        store.open("p");
        store.open("q");
        assert!(!store.load_history("p", vec![sent("p", "a", at(1), None)]));
        assert!(store.messages().is_empty());
        assert_eq!(store.open_peer(), Some("q"));
    }

    #[test]
    fn test_open_evicts_previous_list_and_resets_unread() {
        let mut store = ConversationStore::new("me");
        store.bootstrap(vec![Conversation {
            peer_id: "p".into(),
            display_name: "Pat".into(),
            last_message: None,
            last_message_at: None,
            unread_count: 3,
        }]);
        assert!(!store.open("p"));
        assert_eq!(store.conversation("p").unwrap().unread_count, 0);
        store.append_optimistic(sent("p", "x", at(1), None));

        assert!(store.open("q"));
        assert!(store.messages().is_empty());
        store.open("p");
        assert!(store.messages().is_empty());

        store.close();
        assert_eq!(store.open_peer(), None);
    }

    #[test]
    fn test_conversations_most_recent_first() {
        let mut store = ConversationStore::new("me");
        store.get_or_create("silent");
        store.merge_inbound(&envelope("old", "1", Some(at(1))), at(1));
        store.merge_inbound(&envelope("new", "2", Some(at(5))), at(5));
        store.merge_inbound(&envelope("tie", "3", Some(at(5))), at(5));

        let order: Vec<_> = store.conversations().iter().map(|c| c.peer_id.as_str()).collect();
        assert_eq!(order, vec!["tie", "new", "old", "silent"]);
    }

    #[test]
    fn test_bootstrap_backfills_without_clobbering_newer_state() {
        let mut store = ConversationStore::new("me");
        store.merge_inbound(&envelope("p", "fresh", Some(at(10))), at(10));

        let created = store.bootstrap(vec![
            Conversation {
                peer_id: "p".into(),
                display_name: "Pat".into(),
                last_message: Some("stale".into()),
                last_message_at: Some(at(1)),
                unread_count: 2,
            },
            Conversation::placeholder("r"),
            Conversation::placeholder("me"),
        ]);

        assert_eq!(created, 1);
        let p = store.conversation("p").unwrap();
        assert_eq!(p.display_name, "Pat");
        assert_eq!(p.last_message.as_deref(), Some("fresh"));
        assert_eq!(p.unread_count, 2);
        assert!(store.conversation("me").is_none());
    }

    #[test]
    fn test_bootstrap_keeps_open_conversation_read() {
        let mut store = ConversationStore::new("me");
        store.open("p");
        let mut summary = Conversation::placeholder("p");
        summary.unread_count = 4;
        let mut other = Conversation::placeholder("q");
        other.unread_count = 1;
        store.get_or_create("q");

        store.bootstrap(vec![summary, other]);
        assert_eq!(store.conversation("p").unwrap().unread_count, 0);
        assert_eq!(store.conversation("q").unwrap().unread_count, 1);
    }

    #[test]
    fn test_display_name_lookup_and_backfill() {
        let mut store = ConversationStore::new("me");
        assert_eq!(store.display_name("ghost"), "ghost");
        store.get_or_create("p");
        assert!(store.set_display_name("p", "Pat"));
        assert!(!store.set_display_name("p", "  "));
        assert!(!store.set_display_name("nobody", "N"));
        assert_eq!(store.display_name("p"), "Pat");
    }

    #[test]
    fn test_seen_ids_are_bounded() {
        let mut seen = SeenIds::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("c"));
        assert!(seen.insert("a"));
    }
}
