use bit_field::BitArray;

use super::PROC_MAX_NUM;

/// Process identifier, unique among all currently-live processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub usize);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bitmap allocator with a rotating cursor over `PROC_MAX_NUM` slots.
///
/// The cursor advances on every candidate, taken or not, so a released PID
/// is only offered again once every other slot has had its turn. That
/// spreads reuse instead of hammering the low numbers.
pub struct PidAllocator {
    map: [u8; PROC_MAX_NUM / 8],
    cursor: usize,
}

impl PidAllocator {
    pub fn new() -> Self {
        PidAllocator {
            map: [0; PROC_MAX_NUM / 8],
            cursor: 0,
        }
    }

    /// Hand out the first free PID at or after the cursor, or `None` if the
    /// process table is full.
    pub fn allocate(&mut self) -> Option<Pid> {
        for _ in 0..PROC_MAX_NUM {
            let candidate = self.cursor;
            self.cursor = (self.cursor + 1) % PROC_MAX_NUM;

            if !self.map.get_bit(candidate) {
                self.map.set_bit(candidate, true);
                return Some(Pid(candidate));
            }
        }
        None
    }

    /// Return a PID. Callers must only release PIDs they hold; the bitmap
    /// cannot tell a double release from a valid one.
    pub fn release(&mut self, pid: Pid) {
        self.map.set_bit(pid.0, false);
    }
}
