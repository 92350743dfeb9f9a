use fixedbitset::FixedBitSet;

/// Allocator for MQTT packet identifiers.
///
/// Identifiers are handed out round-robin after the last allocated id, which
/// keeps recently released ids out of circulation for as long as possible.
/// An id stays unavailable until it is released by the operation that owns
/// it. Identifier 0 is reserved by the protocol and never handed out.
#[derive(Debug, Clone)]
pub(crate) struct PidRegistry {
    used: FixedBitSet,
    last: u16,
    in_use: usize,
}

impl PidRegistry {
    pub fn new() -> Self {
        Self {
            // index 0 is wasted as 0 is not a valid packet id
            used: FixedBitSet::with_capacity(u16::MAX as usize + 1),
            last: 0,
            in_use: 0,
        }
    }

    /// Allocate the next free packet identifier.
    ///
    /// Returns `None` when all 65535 identifiers are in use.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.in_use == u16::MAX as usize {
            return None;
        }

        let mut pid = self.last;
        loop {
            pid = if pid == u16::MAX { 1 } else { pid + 1 };
            if !self.used.contains(pid as usize) {
                self.used.insert(pid as usize);
                self.last = pid;
                self.in_use += 1;
                return Some(pid);
            }
        }
    }

    /// Release a previously allocated identifier.
    ///
    /// Releasing an id that is not allocated is a no-op.
    pub fn release(&mut self, pid: u16) {
        if pid != 0 && self.used.contains(pid as usize) {
            self.used.set(pid as usize, false);
            self.in_use -= 1;
        }
    }

    /// Number of identifiers currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Release every identifier.
    pub fn reset(&mut self) {
        self.used.clear();
        self.last = 0;
        self.in_use = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_increment() {
        let mut registry = PidRegistry::new();
        assert_eq!(registry.allocate(), Some(1));
        assert_eq!(registry.allocate(), Some(2));
        assert_eq!(registry.allocate(), Some(3));
        assert_eq!(registry.in_use(), 3);
    }

    #[test]
    fn released_ids_are_reused_after_wrap_around() {
        let mut registry = PidRegistry::new();
        let a = registry.allocate().unwrap();
        let _b = registry.allocate().unwrap();
        registry.release(a);

        // the freshly released id is not handed out immediately
        let c = registry.allocate().unwrap();
        assert_ne!(c, a);
    }

    #[test]
    fn release_is_idempotent() {
        let mut registry = PidRegistry::new();
        let a = registry.allocate().unwrap();
        registry.release(a);
        registry.release(a);
        assert_eq!(registry.in_use(), 0);
    }

    #[test]
    fn zero_is_never_allocated() {
        let mut registry = PidRegistry::new();
        for _ in 0..u16::MAX {
            assert_ne!(registry.allocate(), Some(0));
        }
        // all 65535 ids are taken now
        assert_eq!(registry.allocate(), None);

        registry.release(17);
        assert_eq!(registry.allocate(), Some(17));
    }

    #[test]
    fn reset_frees_everything() {
        let mut registry = PidRegistry::new();
        for _ in 0..100 {
            registry.allocate().unwrap();
        }
        registry.reset();
        assert_eq!(registry.in_use(), 0);
        assert_eq!(registry.allocate(), Some(1));
    }
}
