//! Frame arena
//!
//! Every task frame lives in a slot of the arena. Handles and queue links
//! refer to frames through generation-checked [`FrameId`]s, so a stale id
//! can never observe a slot that has been recycled for another frame.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use super::frame::Frame;

/// Identity of a frame inside its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

impl FrameId {
    /// Bit pattern used by link fields for "no frame"
    pub(crate) const NONE_BITS: u64 = u64::MAX;

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index inside the arena
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this frame was allocated
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub(crate) fn from_bits(bits: u64) -> Option<Self> {
        if bits == Self::NONE_BITS {
            None
        } else {
            Some(Self {
                index: bits as u32,
                generation: (bits >> 32) as u32,
            })
        }
    }

    pub(crate) fn option_bits(id: Option<FrameId>) -> u64 {
        id.map_or(Self::NONE_BITS, FrameId::to_bits)
    }
}

/// Snapshot of arena counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Frames currently holding a slot
    pub live: usize,
    /// Frames allocated since creation
    pub allocated: usize,
    /// Frames whose storage has been released
    pub released: usize,
}

struct Slot {
    generation: u32,
    frame: Option<Arc<Frame>>,
}

/// Slot storage owning every frame of one scheduler
pub struct FrameArena {
    slots: RwLock<Vec<Slot>>,
    free: Mutex<Vec<u32>>,
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl FrameArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Allocate a slot and install the frame built for it.
    ///
    /// The builder runs without any arena lock held, so it may allocate
    /// further frames.
    pub(crate) fn insert_with(&self, build: impl FnOnce(FrameId) -> Frame) -> Arc<Frame> {
        let id = self.reserve();
        let frame = Arc::new(build(id));
        {
            let mut slots = self.slots.write();
            slots[id.index as usize].frame = Some(Arc::clone(&frame));
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        frame
    }

    fn reserve(&self) -> FrameId {
        let recycled = self.free.lock().pop();
        match recycled {
            Some(index) => {
                let generation = self.slots.read()[index as usize].generation;
                FrameId::new(index, generation)
            }
            None => {
                let mut slots = self.slots.write();
                let index = slots.len() as u32;
                slots.push(Slot {
                    generation: 0,
                    frame: None,
                });
                FrameId::new(index, 0)
            }
        }
    }

    /// Look up a live frame
    pub(crate) fn get(&self, id: FrameId) -> Option<Arc<Frame>> {
        let slots = self.slots.read();
        let slot = slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.frame.clone()
    }

    /// Release a frame's storage. Returns false if the id is stale.
    pub(crate) fn release(&self, id: FrameId) -> bool {
        let frame = {
            let mut slots = self.slots.write();
            let Some(slot) = slots.get_mut(id.index as usize) else {
                return false;
            };
            if slot.generation != id.generation || slot.frame.is_none() {
                return false;
            }
            slot.generation = slot.generation.wrapping_add(1);
            slot.frame.take()
        };
        self.free.lock().push(id.index);
        self.released.fetch_add(1, Ordering::Relaxed);
        // Dropped outside the lock: the frame may own handles to other frames.
        drop(frame);
        true
    }

    /// Drop every frame that has not finished. Used once the scheduler has
    /// shut down; finished frames stay until their handles release them.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<Arc<Frame>> = {
            let mut slots = self.slots.write();
            let mut free = self.free.lock();
            slots
                .iter_mut()
                .enumerate()
                .filter_map(|(index, slot)| {
                    if slot.frame.as_ref().map_or(true, |frame| frame.is_done()) {
                        return None;
                    }
                    let frame = slot.frame.take()?;
                    slot.generation = slot.generation.wrapping_add(1);
                    free.push(index as u32);
                    Some(frame)
                })
                .collect()
        };
        let count = drained.len();
        self.released.fetch_add(count, Ordering::Relaxed);
        for frame in &drained {
            frame.mark_done();
        }
        drop(drained);
        count
    }

    /// Get arena statistics
    pub fn stats(&self) -> ArenaStats {
        let allocated = self.allocated.load(Ordering::Relaxed);
        let released = self.released.load(Ordering::Relaxed);
        ArenaStats {
            live: allocated.saturating_sub(released),
            allocated,
            released,
        }
    }
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::frame::{CallContext, Frame};

    fn insert(arena: &FrameArena) -> Arc<Frame> {
        arena.insert_with(|id| Frame::detached(id, CallContext::fresh()))
    }

    #[test]
    fn test_insert_and_get() {
        let arena = FrameArena::new();
        let frame = insert(&arena);
        let found = arena.get(frame.id()).unwrap();
        assert!(Arc::ptr_eq(&frame, &found));
        assert_eq!(arena.stats().live, 1);
    }

    #[test]
    fn test_stale_id_after_release() {
        let arena = FrameArena::new();
        let first = insert(&arena).id();
        assert!(arena.release(first));
        assert!(!arena.release(first));
        assert!(arena.get(first).is_none());

        let second = insert(&arena).id();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert!(arena.get(first).is_none());
        assert!(arena.get(second).is_some());
    }

    #[test]
    fn test_clear_releases_everything() {
        let arena = FrameArena::new();
        for _ in 0..5 {
            insert(&arena);
        }
        assert_eq!(arena.clear(), 5);
        let stats = arena.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.allocated, 5);
        assert_eq!(stats.released, 5);
    }

    #[test]
    fn test_clear_keeps_finished_frames() {
        let arena = FrameArena::new();
        let finished = insert(&arena);
        finished.mark_done();
        let pending = insert(&arena);

        assert_eq!(arena.clear(), 1);
        assert!(arena.get(finished.id()).is_some());
        assert!(arena.get(pending.id()).is_none());
        assert!(pending.is_done());
    }

    #[test]
    fn test_id_bits() {
        let id = FrameId::new(17, 3);
        assert_eq!(FrameId::from_bits(id.to_bits()), Some(id));
        assert_eq!(FrameId::from_bits(FrameId::NONE_BITS), None);
        assert_eq!(FrameId::option_bits(None), FrameId::NONE_BITS);
    }
}
