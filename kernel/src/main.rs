#![feature(abi_x86_interrupt)]
#![no_std]
#![no_main]
extern crate alloc;

mod acpi_handler;
mod apic;
mod cmdline;
mod console;
mod cpu;
mod elf;
mod filesystem;
mod interrupts;
mod lapic;
mod memory;
mod pagetable;
mod panic;
mod process;
mod scheduler;
mod sync;
mod tests;
mod user;
mod userstack;
mod vm;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use acpi::AcpiTables;
use bootloader_api::config::Mapping;
use bootloader_api::{BootInfo, BootloaderConfig};
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::acpi_handler::Handler;
use crate::console::Console;
use crate::cpu::{Cpus, PerCpu};
use crate::filesystem::devfs::Devfs;
use crate::filesystem::ramdisk::Ramdisk;
use crate::filesystem::vfs::VirtualFileSystem;
use crate::memory::PhysicalMemoryManager;
use crate::panic::PANIC_FRAMEBUFFER;
use crate::user::ProcessTable;

/// Physical memory pool backing kernel structures (page tables, per-CPU
/// stacks): spec.md 4.2's "kernel pool".
pub static PMM: OnceCell<Mutex<PhysicalMemoryManager>> = OnceCell::uninit();
/// Physical memory pool backing user address spaces: spec.md 4.2's "user
/// pool".
pub static USER_PMM: OnceCell<Mutex<PhysicalMemoryManager>> = OnceCell::uninit();
pub static CPUS: OnceCell<Cpus> = OnceCell::uninit();
pub static VFS: OnceCell<VirtualFileSystem> = OnceCell::uninit();

/// Virtual address the Local APIC's memory-mapped registers are mapped at.
/// Arbitrary, as long as it doesn't collide with the heap or any user
/// address space (those never reach this high into kernel space).
pub const LAPIC_START_VIRT: u64 = 0x_5555_5555_0000;
/// Virtual address the first IOAPIC's registers are mapped at.
pub const IOAPIC_START_VIRT: u64 = 0x_5555_5556_0000;

/// The device number the root ramdisk filesystem is mounted under.
const RAMDISK_DEV: u32 = 1;
/// The device number `/dev` is mounted under.
const DEVFS_DEV: u32 = 2;

/// Kernel command line to run when the bootloader hands us none (this
/// bootloader protocol carries a ramdisk image but no argument string, so
/// there is no equivalent of Pintos's `-q -f run '...'` from the build
/// tooling yet -- see DESIGN.md).
const DEFAULT_CMDLINE: &str = option_env!("KERNEL_CMDLINE").unwrap_or("-q run /bin/init");

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

bootloader_api::entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    let framebuffer = boot_info.framebuffer.as_mut().unwrap();
    unsafe { PANIC_FRAMEBUFFER = Some(&raw mut *framebuffer) };

    let cpu = unsafe { PerCpu::init_cpu() };
    CPUS.init_once(|| Cpus::new(cpu));
    unsafe {
        CPUS.get().unwrap().get_cpu().init_gdt();
    }

    interrupts::init_idt();

    let (config, actions) =
        cmdline::parse(DEFAULT_CMDLINE).expect("malformed kernel command line");

    let phys_offset = VirtAddr::new(
        boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader did not map physical memory"),
    );
    let user_page_limit = config.user_page_limit.map(|limit| limit as usize);
    let (mut mapper, kernel_pmm, user_pmm) =
        unsafe { memory::init(phys_offset, &boot_info.memory_regions, user_page_limit) };
    PMM.init_once(|| Mutex::new(kernel_pmm));
    USER_PMM.init_once(|| Mutex::new(user_pmm));
    pagetable::record_kernel_pml4();

    let rsdp_addr = boot_info
        .rsdp_addr
        .into_option()
        .expect("bootloader did not report an RSDP address") as usize;
    let acpi_tables = unsafe { AcpiTables::from_rsdp(Handler { phys_offset }, rsdp_addr) }
        .expect("failed to parse ACPI tables");
    let platform_info = acpi_tables
        .platform_info()
        .expect("failed to read ACPI platform info");
    apic::enable(&mut mapper, &platform_info.interrupt_model);

    let console = Arc::new(Mutex::new(Console::new(framebuffer)));
    console::CONSOLE.init_once(|| console.clone());

    let mut vfs = VirtualFileSystem::new();

    let ramdisk_addr = boot_info.ramdisk_addr.into_option();
    let ramdisk_len = boot_info.ramdisk_len as usize;
    let root_files: Vec<(&str, &'static [u8])> = match ramdisk_addr {
        Some(addr) if ramdisk_len > 0 => {
            let bytes = unsafe {
                core::slice::from_raw_parts((phys_offset + addr).as_ptr::<u8>(), ramdisk_len)
            };
            alloc::vec![("init", bytes)]
        }
        _ => alloc::vec![],
    };
    let ramdisk = Ramdisk::from_files(RAMDISK_DEV, root_files);
    vfs.mount(RAMDISK_DEV, Box::new(ramdisk), "bin", 0)
        .expect("failed to mount root ramdisk");

    let devfs = Devfs::init(console.clone(), DEVFS_DEV);
    vfs.mount(DEVFS_DEV, Box::new(devfs), "dev", 0)
        .expect("failed to mount devfs");

    VFS.init_once(|| vfs);

    scheduler::init();
    ProcessTable::init();

    x86_64::instructions::interrupts::enable();

    cmdline::run_actions(&actions, Some(mapper));

    if config.power_off_when_done {
        cmdline::power_off();
    }

    loop {
        scheduler::yield_execution();
    }
}
