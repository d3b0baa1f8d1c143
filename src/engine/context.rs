//! Open-reference bookkeeping: the per-client view of a search path and
//! the generation-checked table that issues opaque reference ids.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::Status;
use crate::model::types::SearchKind;
use crate::policy::resolver::NodeListEntry;

/// Opaque reference id handed to clients. Packs a table slot and a
/// generation counter so a stale id can never resolve to a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefId(u64);

impl RefId {
    pub(crate) fn pack(slot: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(slot))
    }

    pub(crate) fn slot(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw value, for logging only.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Mutable per-reference traversal state, guarded by the context mutex.
#[derive(Debug)]
pub struct ContextState {
    /// Deep copy of the owning config's node list, opened lazily.
    pub node_list: Vec<NodeListEntry>,
    /// Current policy is Automatic (enables the hierarchy re-probe).
    pub is_automatic: bool,
    /// Hierarchy was not discoverable when this list was resolved.
    pub recheck_hierarchy: bool,
}

/// Per-open-reference snapshot of a search path.
///
/// `list_changed` is the only field other threads touch: the store flips it
/// (atomically, without taking the context mutex) when the shared policy is
/// switched underneath this reference. The state mutex serializes query
/// calls on the same reference and is held for the whole run of the query
/// state machine.
pub struct NodeReferenceContext {
    pub kind: SearchKind,
    pub effective_uid: u32,
    pub list_changed: AtomicBool,
    state: Mutex<ContextState>,
}

impl NodeReferenceContext {
    pub fn new(
        kind: SearchKind,
        effective_uid: u32,
        node_list: Vec<NodeListEntry>,
        is_automatic: bool,
        recheck_hierarchy: bool,
    ) -> Self {
        Self {
            kind,
            effective_uid,
            list_changed: AtomicBool::new(false),
            state: Mutex::new(ContextState {
                node_list,
                is_automatic,
                recheck_hierarchy,
            }),
        }
    }

    pub fn mark_list_changed(&self) {
        self.list_changed.store(true, Ordering::SeqCst);
    }

    pub fn take_list_changed(&self) -> bool {
        self.list_changed.swap(false, Ordering::SeqCst)
    }

    pub fn list_changed(&self) -> bool {
        self.list_changed.load(Ordering::SeqCst)
    }

    /// Lock the traversal state. Only the store's query-entry path and the
    /// close path may call this; see the lock-ordering note on
    /// [`crate::engine::store::SearchConfigStore`].
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock()
    }
}

/// What a reference id resolves to.
pub enum RefEntry {
    Node(Arc<NodeReferenceContext>),
    /// Byte offset of an attribute count inside a packed buffer.
    AttrList(usize),
    /// Byte offset of an attribute block inside a packed buffer.
    ValueList(usize),
}

struct Slot {
    generation: u32,
    entry: Option<RefEntry>,
}

/// Generation-checked reference table.
#[derive(Default)]
pub struct RefTable {
    slots: Mutex<Vec<Slot>>,
}

impl RefTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: RefEntry) -> RefId {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter().position(|s| s.entry.is_none()) {
            slots[slot].generation = slots[slot].generation.wrapping_add(1);
            slots[slot].entry = Some(entry);
            return RefId::pack(slot as u32, slots[slot].generation);
        }
        slots.push(Slot {
            generation: 1,
            entry: Some(entry),
        });
        RefId::pack((slots.len() - 1) as u32, 1)
    }

    fn with_entry<R>(&self, id: RefId, f: impl FnOnce(&RefEntry) -> Option<R>) -> Result<R, Status> {
        let slots = self.slots.lock();
        let slot = slots
            .get(id.slot() as usize)
            .filter(|s| s.generation == id.generation())
            .ok_or(Status::InvalidReference)?;
        let entry = slot.entry.as_ref().ok_or(Status::InvalidReference)?;
        f(entry).ok_or(Status::InvalidReference)
    }

    pub fn node(&self, id: RefId) -> Result<Arc<NodeReferenceContext>, Status> {
        self.with_entry(id, |e| match e {
            RefEntry::Node(ctx) => Some(ctx.clone()),
            _ => None,
        })
    }

    pub fn attr_list_offset(&self, id: RefId) -> Result<usize, Status> {
        self.with_entry(id, |e| match e {
            RefEntry::AttrList(off) => Some(*off),
            _ => None,
        })
    }

    pub fn value_list_offset(&self, id: RefId) -> Result<usize, Status> {
        self.with_entry(id, |e| match e {
            RefEntry::ValueList(off) => Some(*off),
            _ => None,
        })
    }

    /// Remove and return the entry; the slot's generation is bumped so the
    /// id can never resolve again.
    pub fn remove(&self, id: RefId) -> Result<RefEntry, Status> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(id.slot() as usize)
            .filter(|s| s.generation == id.generation())
            .ok_or(Status::InvalidReference)?;
        let entry = slot.entry.take().ok_or(Status::InvalidReference)?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(entry)
    }
}
