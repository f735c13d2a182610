#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod serial;
pub mod allocator;
pub mod interrupts;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod loader;
pub mod syscalls;

#[cfg(not(test))]
use core::panic::PanicInfo;

#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    serial::init();
    interrupts::init();
    log_info!("NucleusOS kernel started.");

    memory::init(multiboot_info_addr);
    process::init();
    scheduler::init();
    log_info!("NucleusOS is up; process core ready.");

    x86_64::instructions::interrupts::enable();

    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log_error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
