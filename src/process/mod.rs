//! Process core: PCB storage, PID allocation, address-space ownership and
//! the lifecycle operations (exec, fork, exit, destroy) that tie them to the
//! memory manager, the program loader and the scheduler.

pub mod aspace;
pub mod pid;
pub mod pool;
#[cfg(test)]
pub(crate) mod testing;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::loader::ProgramLoader;
use crate::memory::{AspaceRoot, MapError, MemoryManager, KERNEL_BASE, PAGE_SIZE};
use crate::scheduler::context::Context;
use crate::scheduler::SchedulerPort;

pub use aspace::OwnedUnits;
pub use pid::{Pid, PidAllocator};
pub use pool::{ProcHandle, ProcessPool};

/// Hard cap on simultaneously live processes.
pub const PROC_MAX_NUM: usize = 64;

/// Top of the per-process kernel stack. One mapped page below it; the gap up
/// to `KERNEL_BASE` is left unmapped to catch overruns.
pub const PROC_KERNEL_STACK: u64 = KERNEL_BASE - 16 * PAGE_SIZE as u64;

/// Top of the user stack, spaced far enough below the kernel stack that the
/// two never share a second-level table and an overrun of either faults.
pub const PROC_USER_STACK: u64 = KERNEL_BASE - 1024 * PAGE_SIZE as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Slot acquired, address space not fully built. Never scheduled.
    Unborn,
    /// Fully built and eligible to run.
    Running,
    /// Exited; waiting for the scheduler to reap it.
    Dead,
}

/// One process control block. Plain data; all behavior lives in
/// `ProcessManager` and the `aspace` functions.
pub struct Process {
    pub pid: Option<Pid>,
    pub state: ProcState,
    /// Exit status, meaningful once `state` is `Dead`.
    pub status: i32,
    pub root: Option<AspaceRoot>,
    pub owned: OwnedUnits,
    pub entry: VirtAddr,
    pub context: Context,
    pub kernel_stack_top: VirtAddr,
    pub user_stack_top: VirtAddr,
    pub parent: Option<Pid>,
}

impl Process {
    /// The zeroed state every pool slot is reset to before reuse.
    pub fn unborn() -> Self {
        Process {
            pid: None,
            state: ProcState::Unborn,
            status: 0,
            root: None,
            owned: OwnedUnits::zero(),
            entry: VirtAddr::zero(),
            context: Context::empty(),
            kernel_stack_top: VirtAddr::zero(),
            user_stack_top: VirtAddr::zero(),
            parent: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// Every PID is taken.
    PidsExhausted,
    /// Every PCB slot is taken.
    PoolExhausted,
    /// The memory manager ran out of physical frames.
    OutOfFrames,
    /// The program image is malformed or unloadable.
    BadImage,
}

impl core::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ProcessError::PidsExhausted => write!(f, "no free PID"),
            ProcessError::PoolExhausted => write!(f, "no free process slot"),
            ProcessError::OutOfFrames => write!(f, "out of physical frames"),
            ProcessError::BadImage => write!(f, "bad program image"),
        }
    }
}

impl From<MapError> for ProcessError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfFrames => ProcessError::OutOfFrames,
            MapError::AlreadyMapped => ProcessError::BadImage,
        }
    }
}

/// Owns the PID bitmap and the PCB pool; every lifecycle transition goes
/// through here. Collaborators come in as parameters so the lifecycle logic
/// stays independent of the concrete memory backend, loader and scheduler.
pub struct ProcessManager {
    pids: PidAllocator,
    pool: ProcessPool,
}

impl ProcessManager {
    pub fn new() -> Self {
        ProcessManager {
            pids: PidAllocator::new(),
            pool: ProcessPool::new(),
        }
    }

    /// Reserve a PCB slot and a PID together; on PID exhaustion the slot
    /// goes straight back.
    fn alloc_process(&mut self) -> Result<(ProcHandle, Pid), ProcessError> {
        let handle = self.pool.acquire().ok_or(ProcessError::PoolExhausted)?;
        match self.pids.allocate() {
            Some(pid) => {
                self.pool.get_mut(handle).pid = Some(pid);
                Ok((handle, pid))
            }
            None => {
                self.pool.release(handle);
                Err(ProcessError::PidsExhausted)
            }
        }
    }

    /// Create a process from a program image and hand it to the scheduler.
    ///
    /// Any failure after slot reservation reclaims everything the partial
    /// process acquired; a failed exec leaves no trace.
    pub fn exec<M, L, S>(
        &mut self,
        mm: &mut M,
        loader: &L,
        sched: &mut S,
        image: &[u8],
    ) -> Result<Pid, ProcessError>
    where
        M: MemoryManager,
        L: ProgramLoader,
        S: SchedulerPort,
    {
        let (handle, pid) = self.alloc_process()?;

        let built = aspace::build_for(mm, self.pool.get_mut(handle))
            .and_then(|_| loader.load(mm, self.pool.get_mut(handle), image));
        if let Err(err) = built {
            self.destroy(mm, handle);
            return Err(err);
        }

        // First run starts in the usermode trampoline, which expects the
        // user entry in r12 and the user stack top in r13.
        let proc = self.pool.get_mut(handle);
        let mut ctx = Context::new(
            crate::scheduler::task_startup_addr(),
            proc.kernel_stack_top.as_u64(),
        );
        ctx.r12 = proc.entry.as_u64();
        ctx.r13 = proc.user_stack_top.as_u64();
        proc.context = ctx;
        proc.state = ProcState::Running;

        sched.add(handle);
        crate::log_info!("exec: pid {} ({} bytes image)", pid, image.len());
        Ok(pid)
    }

    /// Duplicate `source` into a new process with a deep copy of its user
    /// address space and a copy of its saved execution state.
    pub fn fork<M, S>(
        &mut self,
        mm: &mut M,
        sched: &mut S,
        source: ProcHandle,
    ) -> Result<Pid, ProcessError>
    where
        M: MemoryManager,
        S: SchedulerPort,
    {
        let (handle, pid) = self.alloc_process()?;

        let cloned = {
            let (clone, src) = self.pool.pair_mut(handle, source);
            aspace::clone_into(mm, clone, src)
        };
        if let Err(err) = cloned {
            self.destroy(mm, handle);
            return Err(err);
        }

        let (clone, src) = self.pool.pair_mut(handle, source);
        if clone.owned != src.owned {
            panic!(
                "fork accounting mismatch: pid {} owns {} units, source pid {:?} owns {}",
                pid,
                clone.owned.units(),
                src.pid,
                src.owned.units()
            );
        }
        clone.state = ProcState::Running;
        clone.context = src.context;
        clone.entry = src.entry;
        clone.kernel_stack_top = src.kernel_stack_top;
        clone.user_stack_top = src.user_stack_top;
        clone.parent = src.pid;

        sched.add(handle);
        crate::log_info!("fork: pid {} cloned from {:?}", pid, clone.parent);
        Ok(pid)
    }

    /// Mark a process dead and record its exit status. Releases nothing; the
    /// scheduler reaps dead processes once they are off the run queue.
    pub fn exit(&mut self, handle: ProcHandle, status: i32) {
        let proc = self.pool.get_mut(handle);
        proc.status = status;
        proc.state = ProcState::Dead;
    }

    /// Reclaim everything a process holds: address space, PID, PCB slot.
    /// Must not run while the process can still be scheduled.
    pub fn destroy<M: MemoryManager>(&mut self, mm: &mut M, handle: ProcHandle) {
        let proc = self.pool.get_mut(handle);
        aspace::tear_down(mm, proc);
        if !proc.owned.is_zero() {
            panic!(
                "pid {:?} still owns {} memory units after teardown",
                proc.pid,
                proc.owned.units()
            );
        }
        if let Some(pid) = proc.pid.take() {
            self.pids.release(pid);
        }
        self.pool.release(handle);
    }

    pub fn get(&self, handle: ProcHandle) -> &Process {
        self.pool.get(handle)
    }

    pub fn get_mut(&mut self, handle: ProcHandle) -> &mut Process {
        self.pool.get_mut(handle)
    }

    pub fn pid_of(&self, handle: ProcHandle) -> Option<Pid> {
        self.pool.get(handle).pid
    }

    /// Raw pointer to a PCB's saved context, for the context-switch asm.
    /// Valid as long as the slot stays acquired; the pool never moves.
    pub(crate) fn context_ptr(&mut self, handle: ProcHandle) -> *mut Context {
        &mut self.pool.get_mut(handle).context as *mut Context
    }
}

lazy_static! {
    pub static ref PROCESS_MANAGER: Mutex<ProcessManager> = Mutex::new(ProcessManager::new());
}

pub fn init() {
    lazy_static::initialize(&PROCESS_MANAGER);
    crate::log_info!("Process table ready: {} slots.", PROC_MAX_NUM);
}

/// Create a process from an ELF image using the kernel's real collaborators.
///
/// Lock order here and in the scheduler: scheduler, process manager, memory.
pub fn exec(image: &[u8]) -> Result<Pid, ProcessError> {
    let mut sched = crate::scheduler::SCHEDULER.lock();
    let mut mgr = PROCESS_MANAGER.lock();
    let mut mm = crate::memory::KERNEL_MEMORY.lock();
    mgr.exec(&mut *mm, &crate::loader::elf::ElfLoader, &mut *sched, image)
}

/// Fork an existing process, normally the current one.
pub fn fork(source: ProcHandle) -> Result<Pid, ProcessError> {
    let mut sched = crate::scheduler::SCHEDULER.lock();
    let mut mgr = PROCESS_MANAGER.lock();
    let mut mm = crate::memory::KERNEL_MEMORY.lock();
    mgr.fork(&mut *mm, &mut *sched, source)
}

/// Mark the current process dead and yield away from it. Does not return to
/// the caller's user code; the scheduler reaps the process afterwards.
pub fn exit_current(status: i32) {
    if let Some(handle) = crate::scheduler::current_handle() {
        PROCESS_MANAGER.lock().exit(handle, status);
    }
    crate::scheduler::yield_now();
}

pub fn current_pid() -> Option<Pid> {
    let handle = crate::scheduler::current_handle()?;
    PROCESS_MANAGER.lock().pid_of(handle)
}
