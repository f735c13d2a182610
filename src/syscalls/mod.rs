use crate::{process, scheduler};

/// Syscall numbers (passed in RAX from userland).
pub const SYS_EXIT: u64 = 0;
pub const SYS_FORK: u64 = 1;
pub const SYS_YIELD: u64 = 2;
pub const SYS_GETPID: u64 = 3;
pub const SYS_EXEC: u64 = 4;

/// Largest program image `SYS_EXEC` accepts.
const EXEC_IMAGE_LIMIT: usize = 16 * 1024 * 1024;

/// Central syscall dispatcher, called from the int 0x80 handler.
/// Arguments come from registers: rax=number, rdi=arg0, rsi=arg1, rdx=arg2.
/// Returns the result in rax; `u64::MAX` signals an error.
pub fn dispatch(number: u64, arg0: u64, arg1: u64, _arg2: u64) -> u64 {
    match number {
        SYS_EXIT => {
            process::exit_current(arg0 as i32);
            // Only reached if there was no current process to exit.
            0
        }
        SYS_FORK => match scheduler::current_handle() {
            Some(handle) => match process::fork(handle) {
                Ok(pid) => pid.0 as u64,
                Err(err) => {
                    crate::log_warn!("syscall: fork failed: {}", err);
                    u64::MAX
                }
            },
            None => u64::MAX,
        },
        SYS_YIELD => {
            scheduler::yield_now();
            0
        }
        SYS_GETPID => process::current_pid().map_or(u64::MAX, |pid| pid.0 as u64),
        SYS_EXEC => {
            // arg0 = pointer to the ELF image, arg1 = its length.
            let ptr = arg0 as *const u8;
            let len = arg1 as usize;
            if ptr.is_null() || len == 0 || len > EXEC_IMAGE_LIMIT {
                return u64::MAX;
            }
            let image = unsafe { core::slice::from_raw_parts(ptr, len) };
            match process::exec(image) {
                Ok(pid) => pid.0 as u64,
                Err(err) => {
                    crate::log_warn!("syscall: exec failed: {}", err);
                    u64::MAX
                }
            }
        }
        _ => {
            crate::log_warn!("syscall: unknown number {}", number);
            u64::MAX
        }
    }
}
