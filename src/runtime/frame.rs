use crate::bytecode::irep::{IrepId, SymId};
use crate::runtime::value::ClassId;

// =============================================================================
// CALL FRAME STACK
// =============================================================================
//
// A LIFO chain of call-site records, stored in a slot arena and linked by
// indices instead of pointers. Free slots are recycled through a free
// list, so push and pop stay O(1) and no slot is ever aliased.

/// Index of a frame slot inside the [`CallStack`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(u32);

/// Everything needed to resume the caller after a call returns, plus the
/// metadata describing the call itself.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    /// Caller resume point.
    pub ret_irep: IrepId,
    pub ret_ip: usize,
    pub ret_base: usize,
    pub ret_target_class: ClassId,

    /// Class that owns the resolved method (may differ from the
    /// receiver's class under fallback dispatch).
    pub own_class: ClassId,
    pub method_id: SymId,
    /// Absolute offset of the callee's register window.
    pub reg_offset: usize,
    pub n_args: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStackError {
    /// Push past the configured frame capacity: fatal resource
    /// exhaustion, never clamped.
    Overflow { capacity: usize },
    /// Pop with no frames: a bytecode-integrity error, fatal.
    Underflow,
}

impl std::fmt::Display for FrameStackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameStackError::Overflow { capacity } => {
                write!(f, "call-frame stack overflow (capacity {})", capacity)
            }
            FrameStackError::Underflow => write!(f, "call-frame stack underflow"),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Used { frame: CallFrame, prev: Option<FrameId> },
    Free { next: Option<FrameId> },
}

/// Arena-backed frame stack. Only the executor holds a reference to it;
/// the head index is the single entry point to the chain.
#[derive(Debug)]
pub struct CallStack {
    slots: Vec<Slot>,
    head: Option<FrameId>,
    free: Option<FrameId>,
    len: usize,
    capacity: usize,
}

impl CallStack {
    pub fn new(capacity: usize) -> Self {
        CallStack {
            slots: Vec::new(),
            head: None,
            free: None,
            len: 0,
            capacity,
        }
    }

    pub fn depth(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The currently executing call's frame (the head of the chain), or
    /// `None` at top level.
    pub fn current(&self) -> Option<&CallFrame> {
        self.head.map(|id| match &self.slots[id.0 as usize] {
            Slot::Used { frame, .. } => frame,
            // head always points at a used slot
            Slot::Free { .. } => unreachable!("frame head points at a free slot"),
        })
    }

    /// Link `frame` as the new head. Fails once the configured capacity
    /// is reached.
    pub fn push(&mut self, frame: CallFrame) -> Result<FrameId, FrameStackError> {
        if self.len == self.capacity {
            return Err(FrameStackError::Overflow {
                capacity: self.capacity,
            });
        }

        let id = match self.free {
            Some(id) => {
                self.free = match self.slots[id.0 as usize] {
                    Slot::Free { next } => next,
                    Slot::Used { .. } => unreachable!("free list points at a used slot"),
                };
                self.slots[id.0 as usize] = Slot::Used {
                    frame,
                    prev: self.head,
                };
                id
            }
            None => {
                let id = FrameId(self.slots.len() as u32);
                self.slots.push(Slot::Used {
                    frame,
                    prev: self.head,
                });
                id
            }
        };

        self.head = Some(id);
        self.len += 1;
        Ok(id)
    }

    /// Unlink and return the head frame, recycling its slot.
    pub fn pop(&mut self) -> Result<CallFrame, FrameStackError> {
        let id = self.head.ok_or(FrameStackError::Underflow)?;

        let slot = std::mem::replace(
            &mut self.slots[id.0 as usize],
            Slot::Free { next: self.free },
        );
        let (frame, prev) = match slot {
            Slot::Used { frame, prev } => (frame, prev),
            Slot::Free { .. } => unreachable!("frame head points at a free slot"),
        };

        self.free = Some(id);
        self.head = prev;
        self.len -= 1;
        Ok(frame)
    }

    /// Drop every frame. Used by session teardown.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.head = None;
        self.free = None;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::class;

    fn frame(ip: usize) -> CallFrame {
        CallFrame {
            ret_irep: IrepId(0),
            ret_ip: ip,
            ret_base: ip * 2,
            ret_target_class: class::OBJECT,
            own_class: class::OBJECT,
            method_id: SymId(1),
            reg_offset: ip * 2 + 1,
            n_args: 0,
        }
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut stack = CallStack::new(8);
        stack.push(frame(1)).unwrap();
        stack.push(frame(2)).unwrap();
        stack.push(frame(3)).unwrap();

        assert_eq!(stack.depth(), 3);
        assert_eq!(stack.current().unwrap().ret_ip, 3);
        assert_eq!(stack.pop().unwrap().ret_ip, 3);
        assert_eq!(stack.pop().unwrap().ret_ip, 2);
        assert_eq!(stack.pop().unwrap().ret_ip, 1);
        assert!(stack.is_empty());
    }

    #[test]
    fn pop_restores_matching_snapshot_across_nesting() {
        let mut stack = CallStack::new(16);
        for depth in 0..10 {
            stack.push(frame(depth)).unwrap();
        }
        for depth in (0..10).rev() {
            let restored = stack.pop().unwrap();
            assert_eq!(restored, frame(depth));
        }
    }

    #[test]
    fn underflow_is_fatal_every_time() {
        let mut stack = CallStack::new(4);
        assert_eq!(stack.pop(), Err(FrameStackError::Underflow));
        stack.push(frame(1)).unwrap();
        stack.pop().unwrap();
        // deterministically fatal again, not clamped
        assert_eq!(stack.pop(), Err(FrameStackError::Underflow));
        assert_eq!(stack.pop(), Err(FrameStackError::Underflow));
    }

    #[test]
    fn overflow_at_capacity_is_fatal() {
        let mut stack = CallStack::new(2);
        stack.push(frame(1)).unwrap();
        stack.push(frame(2)).unwrap();
        assert_eq!(
            stack.push(frame(3)),
            Err(FrameStackError::Overflow { capacity: 2 })
        );
        // stack unchanged by the failed push
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.current().unwrap().ret_ip, 2);
    }

    #[test]
    fn slots_are_recycled_through_the_free_list() {
        let mut stack = CallStack::new(8);
        stack.push(frame(1)).unwrap();
        stack.push(frame(2)).unwrap();
        stack.pop().unwrap();
        stack.pop().unwrap();
        stack.push(frame(3)).unwrap();
        stack.push(frame(4)).unwrap();
        // two slots allocated, reused for the second pair
        assert_eq!(stack.slots.len(), 2);
        assert_eq!(stack.pop().unwrap().ret_ip, 4);
        assert_eq!(stack.pop().unwrap().ret_ip, 3);
    }
}
