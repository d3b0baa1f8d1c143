//! Continuation registry: suspended traversal state parked between calls.
//!
//! Clients never see the state itself, only an opaque generation-checked
//! handle. A handle is verified and consumed on resumption; presenting a
//! stale, foreign, or already-consumed handle is `InvalidContinuation`.
//! Closing a reference releases everything parked against it.

use parking_lot::Mutex;

use crate::engine::context::RefId;
use crate::error::Status;
use crate::model::types::Record;

/// Opaque continuation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuationHandle(u64);

impl ContinuationHandle {
    fn pack(slot: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(slot))
    }

    fn slot(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw value, for logging only.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Where the state machine resumes when the token comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    Fetch,
    Drain,
    FetchAliases,
    ExpandAliases,
    Advance,
}

/// Suspended traversal state for one in-flight query.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationState {
    /// Position in the reference's node list.
    pub node_index: usize,
    pub resume: ResumePoint,
    /// Backend records fetched but not yet committed to an output buffer.
    pub pending: Vec<Record>,
    /// Window into `pending`: next record to commit.
    pub rec_index: usize,
    /// Backend-side resumption cursor for the current node.
    pub backend_cursor: Option<u64>,
    /// Alias record types registered for this query (empty: none).
    pub alias_types: Vec<String>,
    pub meta_target: bool,
    pub meta_source: bool,
    /// 0 = unlimited.
    pub records_limit: u32,
    /// Fully committed records across all calls; never speculative counts.
    pub records_emitted: u32,
    /// Alias recursion guard for the current node.
    pub expansion_depth: u32,
    /// Capacity the output buffer had when the state was parked; a resize
    /// on resumption triggers the discard-and-refetch policy.
    pub buffer_capacity: usize,
}

struct Slot {
    generation: u32,
    entry: Option<(RefId, ContinuationState)>,
}

/// Registry of parked continuations.
#[derive(Default)]
pub struct ContinuationRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl ContinuationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park state for `owner`, returning the opaque handle.
    pub fn park(&self, owner: RefId, state: ContinuationState) -> ContinuationHandle {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter().position(|s| s.entry.is_none()) {
            slots[slot].generation = slots[slot].generation.wrapping_add(1);
            slots[slot].entry = Some((owner, state));
            return ContinuationHandle::pack(slot as u32, slots[slot].generation);
        }
        slots.push(Slot {
            generation: 1,
            entry: Some((owner, state)),
        });
        ContinuationHandle::pack((slots.len() - 1) as u32, 1)
    }

    /// Verify and consume: the handle must be live and parked against
    /// `owner`. On success the state is removed from the registry; a
    /// mismatched owner leaves it parked for the rightful one.
    pub fn take(
        &self,
        handle: ContinuationHandle,
        owner: RefId,
    ) -> Result<ContinuationState, Status> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(handle.slot() as usize)
            .filter(|s| s.generation == handle.generation())
            .ok_or(Status::InvalidContinuation)?;
        match &slot.entry {
            Some((parked_owner, _)) if *parked_owner == owner => {}
            _ => return Err(Status::InvalidContinuation),
        }
        let (_, state) = slot.entry.take().expect("entry checked above");
        slot.generation = slot.generation.wrapping_add(1);
        Ok(state)
    }

    /// Explicit early release. Idempotent in effect: a second release of
    /// the same handle reports `InvalidContinuation`, never a crash.
    pub fn release(&self, handle: ContinuationHandle) -> Result<(), Status> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(handle.slot() as usize)
            .filter(|s| s.generation == handle.generation() && s.entry.is_some())
            .ok_or(Status::InvalidContinuation)?;
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    /// Release everything parked against `owner` (reference close, or a
    /// policy-switch rebase of that reference).
    pub fn release_for_owner(&self, owner: RefId) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if matches!(&slot.entry, Some((o, _)) if *o == owner) {
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.entry.is_some()).count()
    }
}
