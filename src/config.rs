//! Kernel build-time configuration.

/// PIT interrupt rate. One tick is the unit of the sleep queue.
pub const TIMER_FREQUENCY_HZ: u64 = 1000;

/// Size of each task's kernel stack (16 KiB).
pub const TASK_STACK_SIZE: usize = 4096 * 4;

/// Heap usage percentage above which disk caches start evicting.
pub const DEFAULT_CACHE_RATIO: u8 = 30;

/// How long a DMA transfer may stay outstanding before it is reported as timed out.
pub const DMA_TIMEOUT_MS: u64 = 2000;

/// Upper bound on the kernel heap carved out of the multiboot memory map.
pub const MAX_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Sectors moved per PIO command (LBA28 sector count of 0 means 256).
pub const PIO_MAX_SECTORS: usize = 256;

/// Sectors moved per DMA command, bounded by the 64 KiB bounce buffer.
pub const DMA_MAX_SECTORS: usize = 128;

/// Period of the background task that syncs dirty disk caches.
pub const WRITEBACK_INTERVAL_MS: u64 = 5000;
