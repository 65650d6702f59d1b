#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod disk;
pub mod drivers;
pub mod errno;
pub mod fs;
pub mod interrupts;
pub mod memory;
pub mod serial;
pub mod syscalls;
pub mod tasking;
pub mod time;

#[cfg(not(test))]
use core::panic::PanicInfo;

/// Entered from the multiboot2 boot stub with paging set up and the first
/// 1 GiB identity mapped. `ide_bus_master` is the IDE controller's BAR4, or
/// 0 when bus-master DMA is not available.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn kernel_main(multiboot_info_addr: usize, ide_bus_master: u32) -> ! {
    serial::init();
    log_info!("AtomicOS Kernel started.");

    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const multiboot2::BootInformationHeader)
            .expect("Failed to load Multiboot2 info!")
    };
    memory::init(&boot_info);

    interrupts::init();
    time::init();
    tasking::init();
    x86_64::instructions::interrupts::enable();

    let bus_master = match ide_bus_master & 0xFFFC {
        0 => None,
        base => Some(base as u16),
    };
    drivers::init(&boot_info, bus_master);

    tasking::create_kernel_task(writeback_task, "writeback");
    tasking::with_scheduler(|s| s.active = true);
    log_info!("AtomicOS is successfully running!");

    // The boot task is the idle task from here on.
    loop {
        tasking::kernel_yield();
        x86_64::instructions::hlt();
    }
}

/// Periodically pushes dirty cached sectors to their devices.
#[cfg(not(test))]
extern "C" fn writeback_task() {
    loop {
        tasking::sleep_ms(config::WRITEBACK_INTERVAL_MS);
        tasking::deliver_signals();
        if let Err(e) = fs::sync() {
            log_warn!("writeback: {}", e);
        }
    }
}

/// Write back and drop every disk cache, then power off through the
/// ACPI PM1a control port QEMU and Bochs expose. Halts if that is ignored.
#[cfg(not(test))]
pub fn shutdown() -> ! {
    use x86_64::instructions::port::Port;

    if let Err(e) = fs::unmount_all() {
        log_error!("shutdown: {}", e);
    }
    log_info!("Powering off.");
    x86_64::instructions::interrupts::disable();
    unsafe {
        // SLP_TYP = S5, SLP_EN
        Port::<u16>::new(0x604).write(0x2000);
    }
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    log_error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
