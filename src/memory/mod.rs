//! Kernel heap and the memory-pressure gauge used by disk caches.

use linked_list_allocator::LockedHeap;

use crate::config::MAX_HEAP_SIZE;

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(test))]
extern "C" {
    /// End of the kernel image, provided by the linker script.
    static __kernel_end: u8;
}

/// Source of the global memory-usage ratio.
pub trait MemoryGauge: Send + Sync {
    /// Percentage (0..=100) of the budget currently in use.
    fn usage_percent(&self) -> usize;
}

/// Gauge over the kernel heap.
pub struct HeapGauge;

impl MemoryGauge for HeapGauge {
    fn usage_percent(&self) -> usize {
        let heap = ALLOCATOR.lock();
        usage_percent(heap.used(), heap.size())
    }
}

pub fn usage_percent(used: usize, size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    (used.saturating_mul(100) / size).min(100)
}

/// Put the heap in the largest available multiboot2 memory area that lies
/// past the kernel image and the boot modules. The boot code identity maps
/// the first 1 GiB, so physical addresses are usable as-is.
#[cfg(not(test))]
pub fn init(boot_info: &multiboot2::BootInformation) {
    let memory_map_tag = boot_info.memory_map_tag().expect("Memory map tag required");

    let kernel_end = unsafe { core::ptr::addr_of!(__kernel_end) as u64 };
    let image_end = boot_info
        .module_tags()
        .map(|module| module.end_address() as u64)
        .fold(kernel_end, u64::max);
    let identity_limit = 1u64 << 30;

    let (start, end) = memory_map_tag
        .memory_areas()
        .iter()
        .filter(|area| multiboot2::MemoryAreaType::from(area.typ()) == multiboot2::MemoryAreaType::Available)
        .map(|area| {
            let start = (area.start_address().max(image_end) + 0xFFF) & !0xFFF;
            (start, area.end_address().min(identity_limit))
        })
        .filter(|(start, end)| start < end)
        .max_by_key(|(start, end)| end - start)
        .expect("no usable memory for the kernel heap");

    let size = ((end - start) as usize).min(MAX_HEAP_SIZE);
    unsafe { ALLOCATOR.lock().init(start as *mut u8, size) };

    crate::log_info!("Heap initialized at {:#x}, {} KiB.", start, size / 1024);
}
