use crate::bytecode::irep::CatchKind;

// =============================================================================
// UNWIND STACK
// =============================================================================
//
// Fixed-depth record of handler scopes currently being executed by
// exception propagation. An entry is pushed when control transfers into a
// handler target and popped by the handler prologue's `Except`; the depth
// therefore counts in-flight handler activations, which survive a
// preemption boundary so a resumed `run` continues propagation correctly.

/// Nesting limit for in-flight handler activations.
pub const MAX_UNWIND_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindEntry {
    pub kind: CatchKind,
    pub target: u32,
}

/// Exceeding the fixed depth means pathologically nested exception
/// scopes beyond design limits: fatal, not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindOverflow;

impl std::fmt::Display for UnwindOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unwind stack overflow (depth {})", MAX_UNWIND_DEPTH)
    }
}

#[derive(Debug)]
pub struct CatchStack {
    entries: [UnwindEntry; MAX_UNWIND_DEPTH],
    depth: usize,
}

impl CatchStack {
    pub fn new() -> Self {
        CatchStack {
            entries: [UnwindEntry {
                kind: CatchKind::Rescue,
                target: 0,
            }; MAX_UNWIND_DEPTH],
            depth: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn push(&mut self, entry: UnwindEntry) -> Result<(), UnwindOverflow> {
        if self.depth == MAX_UNWIND_DEPTH {
            return Err(UnwindOverflow);
        }
        self.entries[self.depth] = entry;
        self.depth += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<UnwindEntry> {
        if self.depth == 0 {
            return None;
        }
        self.depth -= 1;
        Some(self.entries[self.depth])
    }

    pub fn clear(&mut self) {
        self.depth = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(target: u32) -> UnwindEntry {
        UnwindEntry {
            kind: CatchKind::Ensure,
            target,
        }
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut stack = CatchStack::new();
        stack.push(entry(10)).unwrap();
        stack.push(entry(20)).unwrap();
        assert_eq!(stack.pop().unwrap().target, 20);
        assert_eq!(stack.pop().unwrap().target, 10);
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn overflow_is_fatal_at_fixed_depth() {
        let mut stack = CatchStack::new();
        for i in 0..MAX_UNWIND_DEPTH {
            stack.push(entry(i as u32)).unwrap();
        }
        assert_eq!(stack.push(entry(99)), Err(UnwindOverflow));
        // deterministic: still fatal on retry
        assert_eq!(stack.push(entry(99)), Err(UnwindOverflow));
        assert_eq!(stack.depth(), MAX_UNWIND_DEPTH);
    }

    #[test]
    fn clear_resets_depth() {
        let mut stack = CatchStack::new();
        stack.push(entry(1)).unwrap();
        stack.clear();
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.pop(), None);
    }
}
