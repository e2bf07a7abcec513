//! Per-connection session bookkeeping.
//!
//! Sequence numbers, bounded-memory message-id deduplication, pending acks
//! and new-session dedup — everything the protocol requires per session,
//! independent of transport and crypto. State is owned by exactly one
//! connection and only ever touched from the network thread.

use crate::wire;

/// Dedup set high-water mark; exceeding it triggers a prune.
const PROCESSED_HIGH_WATER: usize = 300;
/// How many of the oldest ids a prune discards.
const PROCESSED_PRUNE_COUNT: usize = 100;

/// Answer to "have we processed this message id before?".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessedState {
    /// Never seen; process it and record it.
    NotSeen,
    /// Known duplicate.
    Seen,
    /// Older than everything we still track — defined as already processed
    /// without consulting the set.
    BelowWatermark,
}

/// Session identity and sequencing state for one connection.
pub struct SessionState {
    session_id: i64,
    next_seq: u32,
    min_processed_id: i64,
    processed_ids: Vec<i64>,
    pending_acks: Vec<i64>,
    processed_changes: Vec<i64>,
}

impl SessionState {
    /// Fresh session with a random nonzero id.
    pub fn new() -> Self {
        Self {
            session_id: random_session_id(),
            next_seq: 0,
            min_processed_id: 0,
            processed_ids: Vec::new(),
            pending_acks: Vec::new(),
            processed_changes: Vec::new(),
        }
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Next sequence number: `counter*2 + 1` for content-related messages
    /// (advancing the counter), `counter*2` for service messages (not
    /// advancing it).
    pub fn generate_message_seq_no(&mut self, increment: bool) -> u32 {
        let value = self.next_seq;
        if increment {
            self.next_seq += 1;
        }
        value * 2 + u32::from(increment)
    }

    /// Dedup check for an inbound message id.
    ///
    /// Even ids are service messages without independent dedup identity and
    /// always report [`ProcessedState::Seen`].
    pub fn is_message_id_processed(&self, message_id: i64) -> ProcessedState {
        if message_id & 1 == 0 {
            return ProcessedState::Seen;
        }
        if self.min_processed_id != 0 && message_id < self.min_processed_id {
            return ProcessedState::BelowWatermark;
        }
        if self.processed_ids.contains(&message_id) {
            ProcessedState::Seen
        } else {
            ProcessedState::NotSeen
        }
    }

    /// Record an id as processed, pruning the set when it outgrows the
    /// high-water mark: sort, drop the oldest ids, raise the watermark to
    /// the smallest retained id.
    pub fn add_processed_message_id(&mut self, message_id: i64) {
        if self.processed_ids.len() > PROCESSED_HIGH_WATER {
            self.processed_ids.sort_unstable();
            self.processed_ids.drain(..PROCESSED_PRUNE_COUNT);
            self.min_processed_id = self.processed_ids.first().copied().unwrap_or(0);
        }
        self.processed_ids.push(message_id);
    }

    /// Queue a message id for acknowledgment (idempotent).
    pub fn add_message_to_confirm(&mut self, message_id: i64) {
        if !self.pending_acks.contains(&message_id) {
            self.pending_acks.push(message_id);
        }
    }

    pub fn has_messages_to_confirm(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    /// Serialize one ack batch covering every pending id, clearing the
    /// pending set atomically with payload construction.
    pub fn generate_confirmation_request(&mut self) -> Option<Vec<u8>> {
        if self.pending_acks.is_empty() {
            return None;
        }
        let ids = std::mem::take(&mut self.pending_acks);
        Some(wire::msgs_ack(&ids))
    }

    /// Whether a server-announced session change was already handled.
    pub fn is_session_processed(&self, session_id: i64) -> bool {
        self.processed_changes.contains(&session_id)
    }

    /// Record a handled session change.
    pub fn add_processed_session(&mut self, session_id: i64) {
        if !self.processed_changes.contains(&session_id) {
            self.processed_changes.push(session_id);
        }
    }

    /// Drop all tracked state and draw a fresh session id. Used when the
    /// key or connection identity changes in a way that invalidates prior
    /// sequencing.
    pub fn recreate_session(&mut self) {
        self.session_id = random_session_id();
        self.next_seq = 0;
        self.min_processed_id = 0;
        self.processed_ids.clear();
        self.pending_acks.clear();
        self.processed_changes.clear();
    }
}

impl Default for SessionState {
    fn default() -> Self { Self::new() }
}

fn random_session_id() -> i64 {
    loop {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("getrandom");
        let id = i64::from_le_bytes(bytes);
        if id != 0 {
            return id;
        }
    }
}
