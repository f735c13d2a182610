use alloc::vec::Vec;

use super::{Process, PROC_MAX_NUM};

/// Handle to one PCB slot in the pool. Plain index; the pool's backing
/// storage never moves, so raw context pointers taken from a slot stay valid
/// for the slot's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcHandle(pub usize);

/// Fixed-capacity pool of PCB storage, pre-sized to `PROC_MAX_NUM`.
///
/// The pool never exposes a partially initialized PCB: `acquire` resets the
/// slot to the unborn (zeroed) state before handing it out.
pub struct ProcessPool {
    slots: Vec<Process>,
    free: Vec<usize>,
}

impl ProcessPool {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(PROC_MAX_NUM);
        for _ in 0..PROC_MAX_NUM {
            slots.push(Process::unborn());
        }
        // Pop order starts at slot 0.
        let free = (0..PROC_MAX_NUM).rev().collect();
        ProcessPool { slots, free }
    }

    pub fn acquire(&mut self) -> Option<ProcHandle> {
        let slot = self.free.pop()?;
        self.slots[slot] = Process::unborn();
        Some(ProcHandle(slot))
    }

    pub fn release(&mut self, handle: ProcHandle) {
        debug_assert!(
            !self.free.contains(&handle.0),
            "PCB slot {} released twice",
            handle.0
        );
        self.free.push(handle.0);
    }

    pub fn get(&self, handle: ProcHandle) -> &Process {
        &self.slots[handle.0]
    }

    pub fn get_mut(&mut self, handle: ProcHandle) -> &mut Process {
        &mut self.slots[handle.0]
    }

    /// Mutable access to one slot together with shared access to another.
    /// Used by fork, where the clone is written while the source is read.
    pub fn pair_mut(&mut self, a: ProcHandle, b: ProcHandle) -> (&mut Process, &Process) {
        assert_ne!(a.0, b.0, "pair_mut needs two distinct slots");
        if a.0 < b.0 {
            let (lo, hi) = self.slots.split_at_mut(b.0);
            (&mut lo[a.0], &hi[0])
        } else {
            let (lo, hi) = self.slots.split_at_mut(a.0);
            (&mut hi[0], &lo[b.0])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcState;

    #[test]
    fn acquire_returns_unborn_pcbs() {
        let mut pool = ProcessPool::new();
        let handle = pool.acquire().unwrap();

        // Dirty the slot, release, reacquire: it must come back zeroed.
        {
            let proc = pool.get_mut(handle);
            proc.state = ProcState::Dead;
            proc.status = 42;
            proc.owned.credit(3);
        }
        pool.release(handle);

        let handle = pool.acquire().unwrap();
        let proc = pool.get(handle);
        assert_eq!(proc.state, ProcState::Unborn);
        assert_eq!(proc.status, 0);
        assert!(proc.owned.is_zero());
        assert!(proc.pid.is_none());
        assert!(proc.root.is_none());
        assert!(proc.parent.is_none());
    }

    #[test]
    fn pool_capacity_is_bounded() {
        let mut pool = ProcessPool::new();
        let mut handles = Vec::new();
        for _ in 0..PROC_MAX_NUM {
            handles.push(pool.acquire().expect("pool should have room"));
        }
        assert!(pool.acquire().is_none());

        pool.release(handles.pop().unwrap());
        assert!(pool.acquire().is_some());
    }
}
