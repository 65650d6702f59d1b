pub mod ide;

/// Register the boot modules as memory disks, scan the IDE channels, then
/// read the partition table of every disk found.
#[cfg(not(test))]
pub fn init(boot_info: &multiboot2::BootInformation, ide_bus_master: Option<u16>) {
    use alloc::boxed::Box;
    use alloc::format;
    use alloc::vec::Vec;
    use crate::disk::{ram::MemoryDisk, registry, Disk, DISKS};

    let mut disks = Vec::new();
    for (i, module) in boot_info.module_tags().enumerate() {
        let start = module.start_address() as usize;
        let end = module.end_address() as usize;
        let image: Vec<u8> = unsafe { core::slice::from_raw_parts(start as *const u8, end - start) }.to_vec();
        let backend = MemoryDisk::from_image(&format!("ram{}", i), 512, image);
        match DISKS.lock().register(Disk::new(Box::new(backend))) {
            Ok(disk) => disks.push(disk),
            Err(e) => crate::log_warn!("Boot module {} not registered: {}", i, e),
        }
    }

    let ide_disks = ide::init(ide_bus_master);
    crate::log_info!("Drivers subsystem initialized, {} IDE drive(s).", ide_disks.len());
    disks.extend(ide_disks);

    let partitions = registry::register_all_partitions(&DISKS, &disks);
    crate::log_info!("{} partition(s) found.", partitions);
}
