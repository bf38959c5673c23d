//! Ordered, de-duplicated message list for the active room.
//!
//! Entries are kept sorted by `(timestamp, arrival sequence)`. A server id
//! appears at most once, and a pending placeholder is replaced by its
//! confirmed copy instead of being shown next to it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::client::ChatApi;
use crate::error::{ChatError, ChatResult};
use crate::models::{DeliveryStatus, Message, RoomKey};

/// Identifies one in-flight optimistic send.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OptimisticHandle {
    temp_id: String,
    client_message_id: String,
}

impl OptimisticHandle {
    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }

    pub fn client_message_id(&self) -> &str {
        &self.client_message_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Inserted,
    /// A pending placeholder was replaced by this message
    Confirmed,
    Duplicate,
    OtherRoom,
    NoRoom,
}

impl InboundOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, InboundOutcome::Inserted | InboundOutcome::Confirmed)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    seq: u64,
}

#[derive(Debug)]
pub struct MessageStore {
    user_id: String,
    room: Option<RoomKey>,
    entries: Vec<Entry>,
    next_seq: u64,
    last_error: Option<ChatError>,
}

impl MessageStore {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            room: None,
            entries: Vec::new(),
            next_seq: 0,
            last_error: None,
        }
    }

    pub fn room(&self) -> Option<&RoomKey> {
        self.room.as_ref()
    }

    /// Bind the store to `room`. Switching rooms drops every entry.
    pub fn set_room(&mut self, room: RoomKey) {
        if self.room.as_ref() != Some(&room) {
            self.entries.clear();
            self.last_error = None;
        }
        self.room = Some(room);
    }

    pub fn clear(&mut self) {
        self.room = None;
        self.entries.clear();
        self.last_error = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.position(id).map(|i| &self.entries[i].message)
    }

    pub fn pending_count(&self) -> usize {
        self.iter().filter(|m| m.is_pending()).count()
    }

    /// Error from the last history load, if it failed.
    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    pub fn record_error(&mut self, error: ChatError) {
        self.last_error = Some(error);
    }

    /// Replace the confirmed list with a freshly loaded history.
    ///
    /// Placeholders of sends still in flight survive the replacement unless
    /// the history already holds their server copy.
    pub fn replace_history(&mut self, history: Vec<Message>) {
        // Messages already on screen cannot be the echo of a pending send.
        let shown: HashSet<String> = self
            .entries
            .iter()
            .filter(|e| !e.message.is_pending())
            .map(|e| e.message.id.clone())
            .collect();
        self.entries.retain(|e| e.message.is_pending());
        self.last_error = None;

        let mut history = history;
        history.sort_by_key(|m| m.timestamp);
        for message in history {
            if self.position(&message.id).is_some() {
                continue;
            }
            if shown.contains(&message.id) || !self.confirm_matching_pending(message.clone()) {
                self.insert_sorted(message);
            }
        }
    }

    /// Merge a re-fetched history without dropping pending entries.
    ///
    /// Returns how many entries were added or replaced.
    pub fn reconcile_history(&mut self, history: Vec<Message>) -> usize {
        let mut changed = 0;
        for message in history {
            if let Some(index) = self.position(&message.id) {
                let existing = &mut self.entries[index].message;
                if message.is_read && !existing.is_read {
                    existing.is_read = true;
                    changed += 1;
                }
                continue;
            }
            if self.confirm_matching_pending(message.clone()) {
                changed += 1;
                continue;
            }
            self.insert_sorted(message);
            changed += 1;
        }
        changed
    }

    /// Apply a message delivered by the socket.
    pub fn apply_inbound(&mut self, message: Message) -> InboundOutcome {
        let Some(room) = &self.room else {
            return InboundOutcome::NoRoom;
        };
        if !room.matches(&message) {
            debug!(room = %room, id = %message.id, "Dropping message for another room");
            return InboundOutcome::OtherRoom;
        }
        if self.position(&message.id).is_some() {
            return InboundOutcome::Duplicate;
        }
        if self.confirm_matching_pending(message.clone()) {
            return InboundOutcome::Confirmed;
        }
        self.insert_sorted(message);
        InboundOutcome::Inserted
    }

    /// Show a message being sent before the server has it.
    pub fn insert_optimistic(&mut self, message: Message) -> OptimisticHandle {
        let handle = OptimisticHandle {
            temp_id: message.id.clone(),
            client_message_id: message.client_message_id.clone().unwrap_or_default(),
        };
        self.insert_sorted(message);
        handle
    }

    /// Replace the placeholder with the server's copy.
    ///
    /// If the echo already arrived the placeholder is simply removed. If the
    /// placeholder is gone (expired), the server copy is inserted.
    pub fn confirm_optimistic(&mut self, handle: &OptimisticHandle, confirmed: Message) -> bool {
        let placeholder = self.position(&handle.temp_id);
        let already_known = self.position(&confirmed.id).is_some();

        match (placeholder, already_known) {
            (Some(index), true) => {
                self.entries.remove(index);
                true
            }
            (Some(index), false) => {
                self.replace_at(index, confirmed);
                true
            }
            (None, false) => {
                self.insert_sorted(confirmed);
                true
            }
            (None, true) => false,
        }
    }

    /// Remove a failed placeholder. The caller restores its text.
    pub fn rollback_optimistic(&mut self, handle: &OptimisticHandle) -> Option<Message> {
        let index = self.position(&handle.temp_id)?;
        let mut message = self.entries.remove(index).message;
        message.status = DeliveryStatus::Failed;
        Some(message)
    }

    /// Drop a placeholder whose confirmation window closed.
    pub fn expire_optimistic(&mut self, handle: &OptimisticHandle) -> Option<Message> {
        let index = self.position(&handle.temp_id)?;
        if !self.entries[index].message.is_pending() {
            return None;
        }
        warn!(temp_id = %handle.temp_id, "Optimistic message expired without confirmation");
        Some(self.entries.remove(index).message)
    }

    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(index) if !self.entries[index].message.is_read => {
                self.entries[index].message.is_read = true;
                true
            }
            _ => false,
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn confirm_matching_pending(&mut self, confirmed: Message) -> bool {
        let by_correlation = confirmed.client_message_id.as_deref().and_then(|cid| {
            self.entries.iter().position(|e| {
                e.message.is_pending() && e.message.client_message_id.as_deref() == Some(cid)
            })
        });

        // Without a correlation id, the oldest own pending entry with the same text.
        let index = by_correlation.or_else(|| {
            if confirmed.sender_id != self.user_id {
                return None;
            }
            self.entries
                .iter()
                .filter(|e| e.message.is_pending() && e.message.body == confirmed.body)
                .min_by_key(|e| e.seq)
                .and_then(|oldest| self.entries.iter().position(|e| e.seq == oldest.seq))
        });

        match index {
            Some(index) => {
                self.replace_at(index, confirmed);
                true
            }
            None => false,
        }
    }

    /// Swap the message at `index`, keeping its arrival sequence.
    fn replace_at(&mut self, index: usize, mut message: Message) {
        let Entry { message: old, seq } = self.entries.remove(index);
        if message.client_message_id.is_none() {
            message.client_message_id = old.client_message_id;
        }
        message.status = DeliveryStatus::Confirmed;
        self.insert_entry(Entry { message, seq });
    }

    fn insert_sorted(&mut self, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert_entry(Entry { message, seq });
    }

    fn insert_entry(&mut self, entry: Entry) {
        let key = (entry.message.timestamp, entry.seq);
        let index = self
            .entries
            .partition_point(|e| (e.message.timestamp, e.seq) < key);
        self.entries.insert(index, entry);
    }
}

/// A [`MessageStore`] shared between the session, its sender and its
/// background tasks. The lock is only held for synchronous updates.
#[derive(Debug, Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<MessageStore>>,
}

impl SharedStore {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MessageStore::new(user_id))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MessageStore> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MessageStore) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Fetch the room history and replace the list with it.
    ///
    /// On failure the list is emptied and the error is kept as
    /// [`MessageStore::last_error`]; the error is also returned.
    pub async fn load_history(
        &self,
        api: &dyn ChatApi,
        room: &RoomKey,
        viewer_id: &str,
    ) -> ChatResult<usize> {
        self.with(|store| store.set_room(room.clone()));
        match api.fetch_history(room, viewer_id).await {
            Ok(history) => Ok(self.with(|store| {
                store.replace_history(history);
                store.len()
            })),
            Err(e) => {
                e.log();
                self.with(|store| {
                    store.replace_history(Vec::new());
                    store.record_error(e.clone());
                });
                Err(e)
            }
        }
    }

    /// Fetch the room history and merge it into the list.
    pub async fn refresh(&self, api: &dyn ChatApi, room: &RoomKey, viewer_id: &str) -> ChatResult<usize> {
        let history = api.fetch_history(room, viewer_id).await?;
        Ok(self.with(|store| {
            if store.room() == Some(room) {
                store.reconcile_history(history)
            } else {
                0
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, secs).unwrap()
    }

    fn msg(id: &str, sender: &str, body: &str, ts: DateTime<Utc>) -> Message {
        let mut m = Message::optimistic(sender, body, "", ts);
        m.id = id.to_string();
        m.client_message_id = None;
        m.conversation_key = Some("A".to_string());
        m.status = DeliveryStatus::Confirmed;
        m.is_read = false;
        m
    }

    fn store() -> MessageStore {
        let mut store = MessageStore::new("me");
        store.set_room(RoomKey::Order("A".into()));
        store
    }

    fn bodies(store: &MessageStore) -> Vec<String> {
        store.iter().map(|m| m.body.clone()).collect()
    }

    fn assert_sorted(store: &MessageStore) {
        let stamps: Vec<_> = store.iter().map(|m| m.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "{:?}", stamps);
    }

    #[test]
    fn test_history_then_inbound_orders_by_timestamp() {
        let mut store = store();
        store.replace_history(vec![msg("1", "ph", "a", at(0))]);
        assert_eq!(store.apply_inbound(msg("2", "ph", "b", at(5))), InboundOutcome::Inserted);
        assert_eq!(bodies(&store), vec!["a", "b"]);
    }

    #[test]
    fn test_no_duplicate_ids_after_overlapping_inbound() {
        let mut store = store();
        store.replace_history(vec![
            msg("1", "ph", "a", at(0)),
            msg("2", "ph", "b", at(1)),
            msg("2", "ph", "b", at(1)),
        ]);
        for id in ["1", "2", "3", "3", "2"] {
            store.apply_inbound(msg(id, "ph", id, at(2)));
        }

        let mut ids: Vec<_> = store.iter().map(|m| m.id.clone()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert_eq!(total, 3);
    }

    #[test]
    fn test_out_of_order_arrivals_stay_sorted() {
        let mut store = store();
        for (id, secs) in [("a", 30), ("b", 10), ("c", 20), ("d", 10), ("e", 0)] {
            store.apply_inbound(msg(id, "ph", id, at(secs)));
            assert_sorted(&store);
        }
        // Equal timestamps keep arrival order.
        assert_eq!(bodies(&store), vec!["e", "b", "d", "c", "a"]);
    }

    #[test]
    fn test_history_sorted_with_unknown_timestamps_first() {
        let mut store = store();
        store.replace_history(vec![
            msg("2", "ph", "late", at(9)),
            msg("1", "ph", "undated", DateTime::<Utc>::UNIX_EPOCH),
            msg("3", "ph", "early", at(1)),
        ]);
        assert_eq!(bodies(&store), vec!["undated", "early", "late"]);
    }

    #[test]
    fn test_room_isolation() {
        let mut store = store();
        let mut other = msg("x", "ph", "secret", at(0));
        other.conversation_key = Some("B".into());
        assert_eq!(store.apply_inbound(other), InboundOutcome::OtherRoom);
        assert!(store.is_empty());

        let mut unbound = MessageStore::new("me");
        assert_eq!(unbound.apply_inbound(msg("1", "ph", "a", at(0))), InboundOutcome::NoRoom);
    }

    #[test]
    fn test_optimistic_confirm_in_place() {
        let mut store = store();
        let handle = store.insert_optimistic(Message::optimistic("me", "Hello", "c1", at(3)));
        assert_eq!(store.len(), 1);
        assert!(store.iter().next().unwrap().is_pending());

        let mut server = msg("srv-1", "me", "Hello", at(3));
        server.client_message_id = Some("c1".into());
        assert!(store.confirm_optimistic(&handle, server));

        let hellos: Vec<_> = store.iter().filter(|m| m.body == "Hello").collect();
        assert_eq!(hellos.len(), 1);
        assert_eq!(hellos[0].id, "srv-1");
        assert_eq!(hellos[0].status, DeliveryStatus::Confirmed);
    }

    #[test]
    fn test_echo_before_ack_is_not_duplicated() {
        let mut store = store();
        let handle = store.insert_optimistic(Message::optimistic("me", "Hello", "c1", at(3)));

        let mut echo = msg("srv-1", "me", "Hello", at(3));
        echo.client_message_id = Some("c1".into());
        assert_eq!(store.apply_inbound(echo.clone()), InboundOutcome::Confirmed);
        assert_eq!(store.apply_inbound(echo.clone()), InboundOutcome::Duplicate);
        assert!(!store.confirm_optimistic(&handle, echo));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_echo_without_correlation_id_matches_oldest_pending() {
        let mut store = store();
        store.insert_optimistic(Message::optimistic("me", "ok", "c1", at(1)));
        store.insert_optimistic(Message::optimistic("me", "ok", "c2", at(2)));

        assert_eq!(store.apply_inbound(msg("s1", "me", "ok", at(1))), InboundOutcome::Confirmed);
        let pending: Vec<_> = store.iter().filter(|m| m.is_pending()).collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].client_message_id.as_deref(), Some("c2"));

        // Someone else saying the same thing is a new message.
        assert_eq!(store.apply_inbound(msg("s2", "ph", "ok", at(2))), InboundOutcome::Inserted);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_rollback_removes_entry() {
        let mut store = store();
        let handle = store.insert_optimistic(Message::optimistic("me", "Test", "c1", at(1)));
        let failed = store.rollback_optimistic(&handle).unwrap();

        assert_eq!(failed.body, "Test");
        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert_eq!(store.iter().filter(|m| m.body == "Test").count(), 0);
        assert!(store.rollback_optimistic(&handle).is_none());
    }

    #[test]
    fn test_expire_only_touches_pending() {
        let mut store = store();
        let handle = store.insert_optimistic(Message::optimistic("me", "hi", "c1", at(1)));
        assert!(store.expire_optimistic(&handle).is_some());
        assert!(store.is_empty());

        let handle = store.insert_optimistic(Message::optimistic("me", "hi", "c2", at(1)));
        let mut server = msg("s", "me", "hi", at(1));
        server.client_message_id = Some("c2".into());
        store.confirm_optimistic(&handle, server);
        assert!(store.expire_optimistic(&handle).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_confirm_after_expiry_inserts_server_copy() {
        let mut store = store();
        let handle = store.insert_optimistic(Message::optimistic("me", "late", "c1", at(1)));
        store.expire_optimistic(&handle);
        assert!(store.confirm_optimistic(&handle, msg("s", "me", "late", at(1))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reconcile_keeps_pending_and_updates_read() {
        let mut store = store();
        store.replace_history(vec![msg("1", "ph", "a", at(0))]);
        store.insert_optimistic(Message::optimistic("me", "draft", "c9", at(8)));

        let mut read = msg("1", "ph", "a", at(0));
        read.is_read = true;
        let changed = store.reconcile_history(vec![read, msg("2", "ph", "b", at(5))]);

        assert_eq!(changed, 2);
        assert!(store.get("1").unwrap().is_read);
        assert_eq!(bodies(&store), vec!["a", "b", "draft"]);
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.reconcile_history(vec![msg("2", "ph", "b", at(5))]), 0);
    }

    #[test]
    fn test_replace_history_keeps_in_flight_sends() {
        let mut store = store();
        store.insert_optimistic(Message::optimistic("me", "sending", "c1", at(9)));
        store.replace_history(vec![msg("1", "ph", "a", at(0))]);
        assert_eq!(bodies(&store), vec!["a", "sending"]);
    }

    #[test]
    fn test_replace_history_folds_pending_into_server_copy() {
        let mut store = store();
        store.insert_optimistic(Message::optimistic("me", "Hi", "c1", at(4)));
        store.insert_optimistic(Message::optimistic("me", "again", "c2", at(6)));
        store.insert_optimistic(Message::optimistic("me", "still sending", "c3", at(7)));

        let mut by_cid = msg("s1", "me", "Hi", at(5));
        by_cid.client_message_id = Some("c1".into());
        store.replace_history(vec![
            msg("1", "ph", "a", at(0)),
            by_cid,
            msg("s2", "me", "again", at(6)),
        ]);

        assert_eq!(store.iter().filter(|m| m.body == "Hi").count(), 1);
        assert_eq!(store.iter().filter(|m| m.body == "again").count(), 1);
        assert_eq!(store.get("s1").unwrap().client_message_id.as_deref(), Some("c1"));
        assert_eq!(store.get("s2").unwrap().client_message_id.as_deref(), Some("c2"));
        assert_eq!(store.pending_count(), 1);
        assert_eq!(bodies(&store), vec!["a", "Hi", "again", "still sending"]);
        assert_sorted(&store);
    }

    #[test]
    fn test_replace_history_keeps_repeated_text_pending() {
        let mut store = store();
        store.replace_history(vec![msg("old", "me", "ok", at(0))]);
        store.insert_optimistic(Message::optimistic("me", "ok", "c1", at(9)));

        store.replace_history(vec![msg("old", "me", "ok", at(0))]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn test_mark_read() {
        let mut store = store();
        store.apply_inbound(msg("1", "ph", "a", at(0)));
        assert!(store.mark_read("1"));
        assert!(!store.mark_read("1"));
        assert!(!store.mark_read("missing"));
    }

    #[test]
    fn test_switching_rooms_clears_entries() {
        let mut store = store();
        store.apply_inbound(msg("1", "ph", "a", at(0)));
        store.set_room(RoomKey::Order("A".into()));
        assert_eq!(store.len(), 1);
        store.set_room(RoomKey::Order("B".into()));
        assert!(store.is_empty());
    }
}
