//! # Stream State
//!
//! In-memory state of one stream: its entries, consumer groups and pending
//! entry lists.
//!
//! State only changes through [`StreamState::apply`]. Callers first *plan*
//! an operation (which decides offsets without mutating anything), persist
//! the resulting [`JournalOp`], then apply it. Journal replay calls the same
//! `apply`, so recovered state matches live state exactly.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;

use super::event::Event;
use super::record::JournalOp;

/// Where a new consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// Deliver every retained entry
    Beginning,
    /// Deliver only entries appended after the group is created
    Latest,
    /// Deliver entries with offset greater than the given one
    After(u64),
}

/// An entry read from a stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamRecord {
    /// Log-assigned offset
    pub offset: u64,
    /// The stored event
    pub event: Event,
}

/// The named consumer group does not exist on the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingGroup;

/// Delivered-but-unacknowledged entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Consumer currently owning the entry
    pub consumer: String,
    /// Last delivery time (Unix millis)
    pub delivered_at_ms: i64,
    /// Number of deliveries so far
    pub delivery_count: u32,
}

/// Pending entry as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInfo {
    pub offset: u64,
    pub consumer: String,
    pub idle_ms: i64,
    pub delivery_count: u32,
}

/// Consumer group cursor
#[derive(Debug, Clone, Default)]
pub struct GroupState {
    /// Highest offset ever delivered to any member
    pub last_delivered: u64,
    /// Pending entries by offset
    pub pending: BTreeMap<u64, PendingEntry>,
}

/// Summary of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub name: String,
    pub length: usize,
    pub first_offset: Option<u64>,
    pub last_offset: Option<u64>,
    pub groups: usize,
    pub pending: usize,
}

/// State of one stream
#[derive(Debug)]
pub struct StreamState {
    name: String,
    next_offset: u64,
    entries: VecDeque<StreamRecord>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    /// Create an empty stream
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_offset: 1,
            entries: VecDeque::new(),
            groups: HashMap::new(),
        }
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset the next append will receive
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Whether a group exists
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Group state, if the group exists
    pub fn group(&self, group: &str) -> Option<&GroupState> {
        self.groups.get(group)
    }

    /// Apply a journaled transition
    pub fn apply(&mut self, op: &JournalOp) {
        match op {
            JournalOp::Append { offset, event } => {
                self.entries.push_back(StreamRecord {
                    offset: *offset,
                    event: event.clone(),
                });
                self.next_offset = self.next_offset.max(offset + 1);
            }
            JournalOp::CreateGroup {
                group,
                last_delivered,
            } => {
                self.groups.entry(group.clone()).or_insert_with(|| GroupState {
                    last_delivered: *last_delivered,
                    pending: BTreeMap::new(),
                });
            }
            JournalOp::Deliver {
                group,
                consumer,
                offsets,
                at_ms,
            } => {
                let Some(state) = self.groups.get_mut(group) else {
                    return;
                };
                for offset in offsets {
                    match state.pending.get_mut(offset) {
                        Some(entry) => {
                            entry.consumer = consumer.clone();
                            entry.delivered_at_ms = *at_ms;
                            entry.delivery_count += 1;
                        }
                        None => {
                            state.pending.insert(
                                *offset,
                                PendingEntry {
                                    consumer: consumer.clone(),
                                    delivered_at_ms: *at_ms,
                                    delivery_count: 1,
                                },
                            );
                        }
                    }
                    state.last_delivered = state.last_delivered.max(*offset);
                }
            }
            JournalOp::Ack { group, offsets } => {
                if let Some(state) = self.groups.get_mut(group) {
                    for offset in offsets {
                        state.pending.remove(offset);
                    }
                }
            }
            JournalOp::Claim {
                group,
                consumer,
                offsets,
                at_ms,
            } => {
                if let Some(state) = self.groups.get_mut(group) {
                    for offset in offsets {
                        if let Some(entry) = state.pending.get_mut(offset) {
                            entry.consumer = consumer.clone();
                            entry.delivered_at_ms = *at_ms;
                            entry.delivery_count += 1;
                        }
                    }
                }
            }
            JournalOp::Trim { before } => {
                while self
                    .entries
                    .front()
                    .map(|e| e.offset < *before)
                    .unwrap_or(false)
                {
                    self.entries.pop_front();
                }
            }
        }
    }

    /// Plan an append of `event`
    pub fn plan_append(&self, event: Event) -> JournalOp {
        JournalOp::Append {
            offset: self.next_offset,
            event,
        }
    }

    /// Plan group creation; `None` if the group already exists
    pub fn plan_create_group(&self, group: &str, start: StartOffset) -> Option<JournalOp> {
        if self.groups.contains_key(group) {
            return None;
        }
        let last_delivered = match start {
            StartOffset::Beginning => 0,
            StartOffset::Latest => self.next_offset - 1,
            StartOffset::After(offset) => offset,
        };
        Some(JournalOp::CreateGroup {
            group: group.to_string(),
            last_delivered,
        })
    }

    /// Plan a group read for `consumer`
    ///
    /// The consumer's own pending entries are redelivered first; new entries
    /// are only handed out once it has none outstanding. Returns `None` when
    /// there is nothing to deliver.
    pub fn plan_read(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        now_ms: i64,
    ) -> Result<Option<JournalOp>, MissingGroup> {
        let state = self.groups.get(group).ok_or(MissingGroup)?;

        let own_pending: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, entry)| entry.consumer == consumer)
            .map(|(offset, _)| *offset)
            .take(max_count)
            .collect();

        let offsets = if !own_pending.is_empty() {
            own_pending
        } else {
            self.entries
                .iter()
                .filter(|e| e.offset > state.last_delivered)
                .map(|e| e.offset)
                .take(max_count)
                .collect()
        };

        if offsets.is_empty() {
            return Ok(None);
        }

        Ok(Some(JournalOp::Deliver {
            group: group.to_string(),
            consumer: consumer.to_string(),
            offsets,
            at_ms: now_ms,
        }))
    }

    /// Plan an acknowledgment; only offsets actually pending are kept
    pub fn plan_ack(&self, group: &str, offsets: &[u64]) -> Result<Option<JournalOp>, MissingGroup> {
        let state = self.groups.get(group).ok_or(MissingGroup)?;
        let mut pending: Vec<u64> = offsets
            .iter()
            .copied()
            .filter(|o| state.pending.contains_key(o))
            .collect();
        pending.sort_unstable();
        pending.dedup();

        if pending.is_empty() {
            return Ok(None);
        }
        Ok(Some(JournalOp::Ack {
            group: group.to_string(),
            offsets: pending,
        }))
    }

    /// Plan a claim of entries idle for at least `min_idle_ms`
    pub fn plan_claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle_ms: i64,
        max_count: usize,
        now_ms: i64,
    ) -> Result<Option<JournalOp>, MissingGroup> {
        let state = self.groups.get(group).ok_or(MissingGroup)?;
        let offsets: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, entry)| entry.consumer != consumer)
            .filter(|(_, entry)| now_ms - entry.delivered_at_ms >= min_idle_ms)
            .map(|(offset, _)| *offset)
            .take(max_count)
            .collect();

        if offsets.is_empty() {
            return Ok(None);
        }
        Ok(Some(JournalOp::Claim {
            group: group.to_string(),
            consumer: consumer.to_string(),
            offsets,
            at_ms: now_ms,
        }))
    }

    /// Plan retention so that at most `max_len` entries remain
    ///
    /// Never drops an entry some group has not yet delivered or still has
    /// pending, so trimming cannot lose unprocessed events.
    pub fn plan_trim(&self, max_len: usize) -> Option<JournalOp> {
        if max_len == 0 || self.entries.len() <= max_len {
            return None;
        }
        let excess = self.entries.len() - max_len;
        let mut before = self.entries[excess].offset;

        for state in self.groups.values() {
            before = before.min(state.last_delivered + 1);
            if let Some((oldest_pending, _)) = state.pending.iter().next() {
                before = before.min(*oldest_pending);
            }
        }

        match self.entries.front() {
            Some(first) if before > first.offset => Some(JournalOp::Trim { before }),
            _ => None,
        }
    }

    /// Records for the given offsets, in the given order
    pub fn records(&self, offsets: &[u64]) -> Vec<StreamRecord> {
        offsets
            .iter()
            .filter_map(|offset| self.find(*offset).cloned())
            .collect()
    }

    fn find(&self, offset: u64) -> Option<&StreamRecord> {
        let (front, back) = self.entries.as_slices();
        if let Ok(i) = front.binary_search_by_key(&offset, |e| e.offset) {
            return Some(&front[i]);
        }
        back.binary_search_by_key(&offset, |e| e.offset)
            .ok()
            .map(|i| &back[i])
    }

    /// Up to `count` records with offset >= `from`, in append order
    pub fn range(&self, from: u64, count: usize) -> Vec<StreamRecord> {
        self.entries
            .iter()
            .filter(|e| e.offset >= from)
            .take(count)
            .cloned()
            .collect()
    }

    /// Pending entries of a group
    pub fn pending(&self, group: &str, now_ms: i64) -> Result<Vec<PendingInfo>, MissingGroup> {
        let state = self.groups.get(group).ok_or(MissingGroup)?;
        Ok(state
            .pending
            .iter()
            .map(|(offset, entry)| PendingInfo {
                offset: *offset,
                consumer: entry.consumer.clone(),
                idle_ms: (now_ms - entry.delivered_at_ms).max(0),
                delivery_count: entry.delivery_count,
            })
            .collect())
    }

    /// Stream summary
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            name: self.name.clone(),
            length: self.entries.len(),
            first_offset: self.entries.front().map(|e| e.offset),
            last_offset: self.entries.back().map(|e| e.offset),
            groups: self.groups.len(),
            pending: self.groups.values().map(|g| g.pending.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str) -> Event {
        Event::with_id(id, "finbot.tx.created", "finbot", json!({}))
    }

    fn append(state: &mut StreamState, id: &str) -> u64 {
        let op = state.plan_append(event(id));
        state.apply(&op);
        state.next_offset() - 1
    }

    fn read(state: &mut StreamState, group: &str, consumer: &str, max: usize) -> Vec<u64> {
        match state.plan_read(group, consumer, max, 1_000).unwrap() {
            Some(op) => {
                state.apply(&op);
                match op {
                    JournalOp::Deliver { offsets, .. } => offsets,
                    _ => unreachable!(),
                }
            }
            None => Vec::new(),
        }
    }

    fn create(state: &mut StreamState, group: &str, start: StartOffset) {
        if let Some(op) = state.plan_create_group(group, start) {
            state.apply(&op);
        }
    }

    #[test]
    fn test_offsets_are_monotonic() {
        let mut state = StreamState::new("finbot.events");
        assert_eq!(append(&mut state, "a"), 1);
        assert_eq!(append(&mut state, "a"), 2);
        assert_eq!(append(&mut state, "b"), 3);
        assert_eq!(state.info().length, 3);
    }

    #[test]
    fn test_create_group_is_idempotent() {
        let mut state = StreamState::new("finbot.events");
        append(&mut state, "a");
        create(&mut state, "g1", StartOffset::Latest);
        assert!(state.plan_create_group("g1", StartOffset::Beginning).is_none());
        assert_eq!(state.group("g1").unwrap().last_delivered, 1);
    }

    #[test]
    fn test_competing_consumers_get_disjoint_entries() {
        let mut state = StreamState::new("finbot.events");
        for id in ["a", "b", "c", "d"] {
            append(&mut state, id);
        }
        create(&mut state, "g1", StartOffset::Beginning);

        let first = read(&mut state, "g1", "c1", 2);
        let second = read(&mut state, "g1", "c2", 10);
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3, 4]);
    }

    #[test]
    fn test_pending_redelivered_before_new_entries() {
        let mut state = StreamState::new("finbot.events");
        append(&mut state, "a");
        create(&mut state, "g1", StartOffset::Beginning);

        assert_eq!(read(&mut state, "g1", "c1", 10), vec![1]);
        append(&mut state, "b");
        assert_eq!(read(&mut state, "g1", "c1", 10), vec![1]);
        assert_eq!(state.group("g1").unwrap().pending[&1].delivery_count, 2);

        let ack = state.plan_ack("g1", &[1]).unwrap().unwrap();
        state.apply(&ack);
        assert_eq!(read(&mut state, "g1", "c1", 10), vec![2]);
    }

    #[test]
    fn test_ack_ignores_unknown_offsets() {
        let mut state = StreamState::new("finbot.events");
        append(&mut state, "a");
        create(&mut state, "g1", StartOffset::Beginning);
        assert!(state.plan_ack("g1", &[42]).unwrap().is_none());
        assert!(state.plan_ack("missing", &[1]).is_err());
    }

    #[test]
    fn test_claim_moves_idle_entries() {
        let mut state = StreamState::new("finbot.events");
        append(&mut state, "a");
        create(&mut state, "g1", StartOffset::Beginning);
        read(&mut state, "g1", "c1", 10);

        assert!(state.plan_claim("g1", "c2", 5_000, 10, 2_000).unwrap().is_none());
        let op = state.plan_claim("g1", "c2", 5_000, 10, 7_000).unwrap().unwrap();
        state.apply(&op);

        let pending = state.pending("g1", 7_000).unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[test]
    fn test_trim_respects_group_progress() {
        let mut state = StreamState::new("finbot.events");
        for id in ["a", "b", "c", "d", "e"] {
            append(&mut state, id);
        }
        create(&mut state, "g1", StartOffset::Beginning);
        read(&mut state, "g1", "c1", 2);

        // offsets 1 and 2 are pending, so nothing may go
        assert!(state.plan_trim(2).is_none());

        let ack = state.plan_ack("g1", &[1, 2]).unwrap().unwrap();
        state.apply(&ack);
        let trim = state.plan_trim(2).unwrap();
        assert_eq!(trim, JournalOp::Trim { before: 3 });
        state.apply(&trim);
        assert_eq!(state.info().first_offset, Some(3));
    }

    #[test]
    fn test_trim_without_groups_uses_max_len() {
        let mut state = StreamState::new("finbot.events");
        for id in ["a", "b", "c", "d"] {
            append(&mut state, id);
        }
        let trim = state.plan_trim(3).unwrap();
        state.apply(&trim);
        assert_eq!(state.range(0, 10).len(), 3);
        assert_eq!(state.records(&[1, 2]).len(), 1);
    }
}
