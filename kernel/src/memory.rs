use alloc::vec::Vec;
use bitflags::bitflags;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::mapper::MapToError;
use x86_64::structures::paging::{
    FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageSize, PageTable,
    PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

pub const HEAP_START: u64 = 0x_4444_4444_0000;
pub const INITIAL_HEAP_SIZE: u64 = 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

bitflags! {
    /// Allocation flags for the physical frame pools (spec.md 4.2).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PalFlags: u32 {
        /// Allocate from the user pool rather than the kernel pool.
        const USER = 1 << 0;
        /// Zero the frame's contents before returning it.
        const ZERO = 1 << 1;
        /// Panic instead of returning `None` on exhaustion.
        const ASSERT = 1 << 2;
    }
}

/// Builds the kernel's offset-mapped page table plus the kernel/user frame
/// pools (spec.md 4.2: "two pools, user and kernel").
///
/// # Safety
/// Can only be called once, with a valid `phys_offset` mapping the entirety
/// of physical memory into kernel space (as `bootloader_api` guarantees).
pub unsafe fn init(
    phys_offset: VirtAddr,
    memory_regions: &'static MemoryRegions,
    user_page_limit: Option<usize>,
) -> (
    OffsetPageTable<'static>,
    PhysicalMemoryManager,
    PhysicalMemoryManager,
) {
    let level_4_table = unsafe { active_level_4_table(phys_offset) };
    let mut mapper = unsafe { OffsetPageTable::new(level_4_table, phys_offset) };

    let mut all_frames = unsafe { LinearFrameAllocator::new(memory_regions) };

    let heap_start = VirtAddr::new(HEAP_START);
    let heap_end = heap_start + INITIAL_HEAP_SIZE - 1u64;
    let page_range = Page::range_inclusive(
        Page::containing_address(heap_start),
        Page::containing_address(heap_end),
    );
    for page in page_range {
        let frame = all_frames
            .allocate_frame()
            .expect("Failed to initialise heap");
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        unsafe {
            map_checked(&mut mapper, page, frame, flags, &mut all_frames);
        }
    }
    unsafe { ALLOCATOR.lock().init(heap_start.as_mut_ptr(), INITIAL_HEAP_SIZE as usize) };

    // Everything the linear scan hasn't handed out yet is split between a
    // kernel pool (page tables, per-CPU/IST stacks, internal bookkeeping)
    // and a user pool (process address spaces).
    let mut remaining: Vec<PhysFrame> =
        core::iter::from_fn(|| all_frames.allocate_frame()).collect();
    let user_count = user_page_limit
        .unwrap_or(remaining.len() / 2)
        .min(remaining.len());
    let user_frames = remaining.split_off(remaining.len() - user_count);

    let kernel_pmm = PhysicalMemoryManager {
        free_frames: remaining,
        phys_offset,
    };
    let user_pmm = PhysicalMemoryManager {
        free_frames: user_frames,
        phys_offset,
    };

    (mapper, kernel_pmm, user_pmm)
}

unsafe fn map_checked(
    mapper: &mut OffsetPageTable<'static>,
    page: Page<Size4KiB>,
    frame: PhysFrame,
    flags: PageTableFlags,
    allocator: &mut impl FrameAllocator<Size4KiB>,
) {
    match unsafe { mapper.map_to(page, frame, flags, allocator) } {
        Ok(flush) => flush.flush(),
        Err(MapToError::PageAlreadyMapped(_)) => {}
        Err(e) => panic!("Failed to create mapping: {:?}", e),
    }
}

unsafe fn active_level_4_table(phys_offset: VirtAddr) -> &'static mut PageTable {
    use x86_64::registers::control::Cr3;
    let (frame, _) = Cr3::read();
    let virt = phys_offset + frame.start_address().as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();
    unsafe { &mut *page_table_ptr }
}

/// A free-list-backed pool of physical frames, usable as either the kernel
/// or the user pool.
pub struct PhysicalMemoryManager {
    free_frames: Vec<PhysFrame>,
    phys_offset: VirtAddr,
}

impl PhysicalMemoryManager {
    /// Allocates one frame honoring `flags`. Returns `None` on exhaustion
    /// unless `PalFlags::ASSERT` is set, in which case it panics.
    pub fn alloc(&mut self, flags: PalFlags) -> Option<PhysFrame> {
        let frame = self.free_frames.pop();
        match frame {
            Some(frame) => {
                if flags.contains(PalFlags::ZERO) {
                    let dst = unsafe {
                        core::slice::from_raw_parts_mut(
                            (self.phys_offset + frame.start_address().as_u64())
                                .as_mut_ptr::<u8>(),
                            Size4KiB::SIZE as usize,
                        )
                    };
                    dst.fill(0);
                }
                Some(frame)
            }
            None if flags.contains(PalFlags::ASSERT) => panic!("frame pool exhausted"),
            None => None,
        }
    }

    pub fn free(&mut self, frame: PhysFrame) {
        self.free_frames.push(frame);
    }

    pub fn available(&self) -> usize {
        self.free_frames.len()
    }
}

unsafe impl FrameAllocator<Size4KiB> for PhysicalMemoryManager {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.free_frames.pop()
    }
}

impl FrameDeallocator<Size4KiB> for PhysicalMemoryManager {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free_frames.push(frame);
    }
}

struct LinearFrameAllocator {
    next: usize,
    memory_regions: &'static MemoryRegions,
}

impl LinearFrameAllocator {
    fn available_frames(&self) -> impl Iterator<Item = PhysFrame> {
        let available_memory_regions = self
            .memory_regions
            .iter()
            .filter(|region| region.kind == MemoryRegionKind::Usable);

        available_memory_regions
            .flat_map(|region| region.start..region.end)
            .filter(|addr| (addr & 0xfff) == 0)
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }

    unsafe fn new(memory_regions: &'static MemoryRegions) -> Self {
        LinearFrameAllocator {
            next: 0,
            memory_regions,
        }
    }
}

unsafe impl FrameAllocator<Size4KiB> for LinearFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.available_frames().nth(self.next);
        self.next += 1;
        frame
    }
}
