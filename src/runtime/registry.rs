use parking_lot::Mutex;

// =============================================================================
// REGISTRY - process-wide executor accounting
// =============================================================================
//
// Executors register at `open` and deregister at `close` (or drop).
// `cleanup_all` is the emergency sweep for anything still registered.
// A single bitmap word keeps the whole thing lock-cheap.

/// Maximum number of simultaneously open executors.
pub const MAX_VM_COUNT: usize = 64;

static VM_BITMAP: Mutex<u64> = Mutex::new(0);

/// Process-unique executor id, 1-based like the original's `vm_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmId(u8);

impl VmId {
    pub fn get(self) -> u8 {
        self.0
    }
}

/// Claim the lowest free id, or `None` when all are taken.
pub fn acquire() -> Option<VmId> {
    let mut bitmap = VM_BITMAP.lock();
    for bit in 0..MAX_VM_COUNT {
        let mask = 1u64 << bit;
        if *bitmap & mask == 0 {
            *bitmap |= mask;
            return Some(VmId(bit as u8 + 1));
        }
    }
    None
}

/// Return an id to the pool. Releasing an already-free id is a no-op.
pub fn release(id: VmId) {
    let mut bitmap = VM_BITMAP.lock();
    *bitmap &= !(1u64 << (id.0 - 1));
}

/// Emergency sweep: deregister every still-registered executor id.
pub fn cleanup_all() {
    *VM_BITMAP.lock() = 0;
}

/// Number of currently registered executors.
pub fn active_count() -> usize {
    VM_BITMAP.lock().count_ones() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // Registry state is process-global and other tests open executors
    // concurrently, so assertions stay relative to the ids this test
    // holds rather than absolute counts.
    #[test]
    fn acquire_release_cycle() {
        let a = acquire().unwrap();
        let b = acquire().unwrap();
        assert_ne!(a, b);
        assert!(a.get() >= 1);
        assert!(active_count() >= 2);

        release(a);
        release(b);
        // released ids become claimable again
        let c = acquire().unwrap();
        release(c);
    }

    #[test]
    fn release_is_idempotent() {
        let a = acquire().unwrap();
        release(a);
        release(a);
        let b = acquire().unwrap();
        release(b);
    }
}
