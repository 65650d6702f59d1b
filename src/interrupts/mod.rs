//! PIC setup and the IRQ bodies called from the assembly interrupt stubs.
//! The IDT itself is installed by the boot code.

use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::drivers::ide;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

const PIC_1_DATA: u16 = 0x21;
const PIC_2_DATA: u16 = 0xA1;

pub static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    PrimaryAta = PIC_1_OFFSET + 14,
    SecondaryAta = PIC_1_OFFSET + 15,
}

impl InterruptIndex {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }

    /// Line number on the chained PICs.
    pub fn irq(self) -> u8 {
        self.as_u8() - PIC_1_OFFSET
    }
}

/// Mask bytes for the two PICs with only `irqs` (and the cascade line) open.
pub fn pic_masks(irqs: &[u8]) -> (u8, u8) {
    let mut master = 0xFFu8;
    let mut slave = 0xFFu8;
    for &irq in irqs {
        if irq < 8 {
            master &= !(1 << irq);
        } else {
            slave &= !(1 << (irq - 8));
            master &= !(1 << 2);
        }
    }
    (master, slave)
}

/// Remap the PICs and unmask the timer and both IDE channels.
pub fn init() {
    let (master, slave) = pic_masks(&[
        InterruptIndex::Timer.irq(),
        InterruptIndex::PrimaryAta.irq(),
        InterruptIndex::SecondaryAta.irq(),
    ]);
    unsafe {
        PICS.lock().initialize();
        Port::<u8>::new(PIC_1_DATA).write(master);
        Port::<u8>::new(PIC_2_DATA).write(slave);
    }
    crate::log_info!("PICs remapped to {}..{}.", PIC_1_OFFSET, PIC_2_OFFSET + 8);
}

fn end_of_interrupt(index: InterruptIndex) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(index.as_u8());
    }
}

/// IRQ 0. Only advances the clock; switching happens at the next
/// cooperative `schedule()`.
#[no_mangle]
pub extern "C" fn timer_interrupt() {
    crate::time::tick();
    end_of_interrupt(InterruptIndex::Timer);
}

/// IRQ 14.
#[no_mangle]
pub extern "C" fn primary_ata_interrupt() {
    ide::handle_interrupt(ide::PRIMARY.index);
    end_of_interrupt(InterruptIndex::PrimaryAta);
}

/// IRQ 15.
#[no_mangle]
pub extern "C" fn secondary_ata_interrupt() {
    ide::handle_interrupt(ide::SECONDARY.index);
    end_of_interrupt(InterruptIndex::SecondaryAta);
}
