//! Cooperative round-robin scheduler over PCB handles. The scheduler never
//! owns process state; it queues handles and asks the process manager for
//! everything else.

pub mod context;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use context::Context;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::process::{ProcHandle, ProcState, PROCESS_MANAGER};

/// What the process core needs from a scheduler: take ownership of a newly
/// runnable process. Everything else (picking, switching, reaping) is the
/// scheduler's business.
pub trait SchedulerPort {
    fn add(&mut self, handle: ProcHandle);
}

pub struct Scheduler {
    pub run_queue: VecDeque<ProcHandle>,
    pub current: Option<ProcHandle>,
    /// Dead processes that were current when they exited. Their kernel stack
    /// is still in use at that point, so reclamation waits until the next
    /// pass runs on a different stack.
    reap_list: Vec<ProcHandle>,
    /// Saved state of the boot flow, which is not a process. The first
    /// hand-off switches away from it; it resumes once the queue drains.
    boot_context: Context,
    pub active: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            run_queue: VecDeque::new(),
            current: None,
            reap_list: Vec::new(),
            boot_context: Context::empty(),
            active: false,
        }
    }
}

impl SchedulerPort for Scheduler {
    fn add(&mut self, handle: ProcHandle) {
        self.run_queue.push_back(handle);
    }
}

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

pub fn init() {
    SCHEDULER.lock().active = true;
    crate::log_info!("Scheduler active.");
}

pub fn current_handle() -> Option<ProcHandle> {
    SCHEDULER.lock().current
}

/// Kernel-side resume address for a process that has never run. The initial
/// context carries the user entry point in r12 and the user stack top in
/// r13, which the trampoline feeds into the Ring 3 transition.
pub(crate) fn task_startup_addr() -> u64 {
    crate::interrupts::usermode::usermode_trampoline as *const () as u64
}

enum SwitchPlan {
    Stay,
    Switch {
        save: Option<*mut Context>,
        restore: *const Context,
    },
}

/// Give up the CPU: reap what is reapable, pick the next runnable process
/// and switch to it. Returns when this context is scheduled again; never
/// returns for a context whose process has exited.
pub fn yield_now() {
    use x86_64::instructions::interrupts;

    // Preserve the caller's IF state: yields arrive both from kernel code
    // with interrupts on and from the int 0x80 gate, which clears IF.
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();
    let plan = plan_switch();
    match plan {
        SwitchPlan::Stay => {}
        SwitchPlan::Switch { save, restore } => unsafe {
            match save {
                Some(old) => context::switch_context(old, restore),
                None => context::restore_context(restore),
            }
        },
    }
    if were_enabled {
        interrupts::enable();
    }
}

/// Decide the next hand-off with all locks held, returning raw context
/// pointers so the actual switch happens after every lock is released. The
/// pointers stay valid because PCB slots and the scheduler itself never
/// move.
fn plan_switch() -> SwitchPlan {
    let mut sched = SCHEDULER.lock();
    if !sched.active {
        return SwitchPlan::Stay;
    }
    let mut mgr = PROCESS_MANAGER.lock();
    let mut mm = crate::memory::KERNEL_MEMORY.lock();

    // Reap first: processes that exited while current (their stack is free
    // now), plus anything in the queue that died while waiting.
    for handle in sched.reap_list.drain(..) {
        mgr.destroy(&mut *mm, handle);
    }
    let dead: Vec<ProcHandle> = sched
        .run_queue
        .iter()
        .copied()
        .filter(|&h| mgr.get(h).state == ProcState::Dead)
        .collect();
    sched.run_queue.retain(|&h| mgr.get(h).state != ProcState::Dead);
    for handle in dead {
        mgr.destroy(&mut *mm, handle);
    }

    let previous = sched.current.take();
    if let Some(handle) = previous {
        match mgr.get(handle).state {
            ProcState::Running => sched.run_queue.push_back(handle),
            _ => sched.reap_list.push(handle),
        }
    }

    let next = match sched.run_queue.pop_front() {
        Some(handle) => handle,
        None => {
            // A runnable current would have been requeued above, so an empty
            // queue means the boot flow is running, or the current process
            // died and nothing is left: resume boot in that case.
            return match previous {
                Some(_) => SwitchPlan::Switch {
                    save: None,
                    restore: &sched.boot_context as *const Context,
                },
                None => SwitchPlan::Stay,
            };
        }
    };

    if previous == Some(next) {
        sched.current = Some(next);
        return SwitchPlan::Stay;
    }
    sched.current = Some(next);

    // Per-process CPU state: kernel stack for Ring 3 entries. The process
    // root is ownership bookkeeping only and is never loaded into CR3; the
    // CPU keeps running on the boot-time tables (see `memory::paging`).
    let kernel_stack_top = mgr.get(next).kernel_stack_top.as_u64();
    crate::interrupts::gdt::set_tss_rsp0(kernel_stack_top);

    let restore = mgr.context_ptr(next) as *const Context;
    let save = match previous {
        Some(handle) if mgr.get(handle).state == ProcState::Running => {
            Some(mgr.context_ptr(handle))
        }
        // Dead current: nothing to save, reaped on the next pass.
        Some(_) => None,
        // Boot flow hands off for the first time.
        None => Some(&mut sched.boot_context as *mut Context),
    };

    SwitchPlan::Switch { save, restore }
}
