//! Intrusive FIFO of frames
//!
//! The queue stores only its head and tail ids. Each frame carries its own
//! `queue_link`, so moving frames between queues never allocates. The queue
//! itself is not synchronized: the ready queue and every timer bucket wrap
//! it in their own mutex.

use std::sync::Arc;
use super::arena::{FrameArena, FrameId};
use super::frame::Frame;

/// FIFO of frames linked through their `queue_link` field
#[derive(Debug, Default)]
pub struct FrameQueue {
    head: Option<FrameId>,
    tail: Option<FrameId>,
    len: usize,
}

impl FrameQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued frames
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the queue holds no frames
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a frame at the tail
    pub(crate) fn append(&mut self, arena: &FrameArena, frame: &Frame) {
        frame.set_queue_link(None);
        let id = frame.id();
        match self.tail.and_then(|tail| arena.get(tail)) {
            Some(tail) => tail.set_queue_link(Some(id)),
            None => {
                if self.tail.is_some() {
                    log::error!("Queue tail vanished from the arena, dropping {} frames", self.len);
                    self.len = 0;
                }
                self.head = Some(id);
            }
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Remove and return the head frame
    pub(crate) fn pop_head(&mut self, arena: &FrameArena) -> Option<Arc<Frame>> {
        let id = self.head?;
        let Some(frame) = arena.get(id) else {
            log::error!("Queue head {:?} vanished from the arena, dropping {} frames", id, self.len);
            *self = Self::default();
            return None;
        };
        self.head = frame.queue_link();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        frame.set_queue_link(None);
        Some(frame)
    }

    /// Move every frame matching `pred` into `target`, keeping relative order.
    /// Returns how many frames moved.
    pub(crate) fn extract_matching<F>(&mut self, arena: &FrameArena, mut pred: F, target: &mut FrameQueue) -> usize
    where
        F: FnMut(&Frame) -> bool,
    {
        let mut moved = 0;
        let mut prev: Option<Arc<Frame>> = None;
        let mut cursor = self.head;

        while let Some(id) = cursor {
            let Some(frame) = arena.get(id) else {
                log::error!("Queued frame {:?} vanished from the arena", id);
                break;
            };
            let next = frame.queue_link();
            if pred(&frame) {
                match &prev {
                    Some(prev) => prev.set_queue_link(next),
                    None => self.head = next,
                }
                if self.tail == Some(id) {
                    self.tail = prev.as_ref().map(|prev| prev.id());
                }
                self.len -= 1;
                target.append(arena, &frame);
                moved += 1;
            } else {
                prev = Some(frame);
            }
            cursor = next;
        }

        moved
    }
}
