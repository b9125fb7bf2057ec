//! Page-table manager (spec.md 4.1).
//!
//! `x86_64::structures::paging::OffsetPageTable` already gives us
//! map/unmap/translate; what it does not give us is "create a fresh root
//! that shares the kernel half", "walk every present user leaf", or
//! "free every user-half frame recursively" — so this module adds those on
//! top, in the same manual phys-offset page-table-walk style
//! `user::UserProcess::fork_page_table` already uses.

use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{
    FrameDeallocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PageTableIndex,
    PhysFrame, Size4KiB, Translate,
};
use x86_64::VirtAddr;

use crate::memory::{PalFlags, PhysicalMemoryManager};

static KERNEL_PML4: OnceCell<PhysFrame> = OnceCell::uninit();

/// Captures the boot page table's root frame. Must run once, early, before
/// any process's address space switches CR3 away from it, so that exiting
/// processes have something known-safe to switch back to before their own
/// root is destroyed.
pub fn record_kernel_pml4() {
    KERNEL_PML4.init_once(|| Cr3::read().0);
}

/// Switches CR3 back to the kernel's boot root if it isn't already active.
/// `pml4_destroy`'s safety contract forbids tearing down the currently
/// active table, so a process must hop off its own root before destroying
/// it on exit.
pub fn activate_kernel_pml4() {
    let kernel_root = *KERNEL_PML4.get().expect("record_kernel_pml4 not called");
    let (current_frame, flags) = Cr3::read();
    if current_frame != kernel_root {
        unsafe { Cr3::write(kernel_root, flags) };
    }
}

/// Allocates a fresh PML4 whose upper half (kernel-space entries, index
/// 256..512) is copied from the currently active page table, and whose
/// lower half is empty. Returns the new root frame and an `OffsetPageTable`
/// over it.
pub fn pml4_create(
    phys_offset: VirtAddr,
    pmm: &mut PhysicalMemoryManager,
) -> (PhysFrame, OffsetPageTable<'static>) {
    let frame = pmm
        .alloc(PalFlags::ZERO | PalFlags::ASSERT)
        .expect("pml4_create: frame pool exhausted");

    let (current_frame, _) = Cr3::read();
    let current: &PageTable = unsafe { &*(phys_offset + current_frame.start_address().as_u64()).as_ptr() };
    let new_table: &mut PageTable = unsafe { &mut *(phys_offset + frame.start_address().as_u64()).as_mut_ptr() };

    for i in 256..512 {
        new_table[i] = current[i].clone();
    }

    let mapper = unsafe { OffsetPageTable::new(new_table, phys_offset) };
    (frame, mapper)
}

/// Frees every present user-half (index < 256) frame reachable from `root`,
/// then the root itself. Mirrors `pml4_destroy` in spec.md 4.1.
///
/// # Safety
/// `root` must not be the currently active CR3 and must not be referenced
/// by any other thread.
pub unsafe fn pml4_destroy(
    phys_offset: VirtAddr,
    root: PhysFrame,
    pmm: &mut PhysicalMemoryManager,
) {
    let table: &PageTable = unsafe { &*(phys_offset + root.start_address().as_u64()).as_ptr() };
    unsafe { destroy_level(phys_offset, table, 4, pmm) };
    pmm.free(root);
}

unsafe fn destroy_level(
    phys_offset: VirtAddr,
    table: &PageTable,
    level: u8,
    pmm: &mut PhysicalMemoryManager,
) {
    for (i, entry) in table.iter().enumerate() {
        if level == 4 && i >= 256 {
            continue; // kernel half, not ours to free
        }
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            continue;
        }
        let frame = entry.frame().unwrap();
        if level > 1 {
            let child: &PageTable = unsafe { &*(phys_offset + frame.start_address().as_u64()).as_ptr() };
            unsafe { destroy_level(phys_offset, child, level - 1, pmm) };
        }
        pmm.free(frame);
    }
}

/// Resolves a user VA to its kernel-addressable backing, if mapped.
pub fn pml4_get_page(mapper: &OffsetPageTable<'static>, va: VirtAddr) -> Option<VirtAddr> {
    mapper
        .translate_addr(va)
        .map(|phys| mapper.phys_offset() + phys.as_u64())
}

/// Installs a mapping. Fails if `va`'s page is already mapped.
pub fn pml4_set_page(
    mapper: &mut OffsetPageTable<'static>,
    va: VirtAddr,
    frame: PhysFrame,
    writable: bool,
    executable: bool,
    pmm: &mut PhysicalMemoryManager,
) -> Result<(), ()> {
    let page = Page::<Size4KiB>::containing_address(va);
    if mapper.translate_page(page).is_ok() {
        return Err(());
    }
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    if !executable {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    unsafe {
        mapper
            .map_to(page, frame, flags, pmm)
            .map_err(|_| ())?
            .flush();
    }
    Ok(())
}

/// Removes a mapping and returns the frame it backed, if any. The caller is
/// responsible for returning the frame to the correct pool and flushing the
/// TLB on the next activation.
pub fn pml4_clear_page(mapper: &mut OffsetPageTable<'static>, va: VirtAddr) -> Option<PhysFrame> {
    let page = Page::<Size4KiB>::containing_address(va);
    match mapper.unmap(page) {
        Ok((frame, flush)) => {
            flush.flush();
            Some(frame)
        }
        Err(_) => None,
    }
}

fn leaf_flags(mapper: &OffsetPageTable<'static>, va: VirtAddr) -> Option<PageTableFlags> {
    let phys_offset = mapper.phys_offset();
    let (root_frame, _) = Cr3::read();
    let _ = root_frame; // the root walked is whichever table `mapper` owns, not necessarily CR3
    let page = Page::<Size4KiB>::containing_address(va);
    let l4: &PageTable = mapper.level_4_table();
    let l4e = &l4[va_index(va, 3)];
    if !l4e.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    let l3: &PageTable = unsafe { &*(phys_offset + l4e.addr().as_u64()).as_ptr() };
    let l3e = &l3[va_index(va, 2)];
    if !l3e.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    let l2: &PageTable = unsafe { &*(phys_offset + l3e.addr().as_u64()).as_ptr() };
    let l2e = &l2[va_index(va, 1)];
    if !l2e.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    let l1: &PageTable = unsafe { &*(phys_offset + l2e.addr().as_u64()).as_ptr() };
    let l1e = &l1[va_index(va, 0)];
    let _ = page;
    if !l1e.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some(l1e.flags())
}

fn va_index(va: VirtAddr, level: u8) -> PageTableIndex {
    match level {
        3 => va.p4_index(),
        2 => va.p3_index(),
        1 => va.p2_index(),
        _ => va.p1_index(),
    }
}

pub fn pml4_is_dirty(mapper: &OffsetPageTable<'static>, va: VirtAddr) -> bool {
    leaf_flags(mapper, va)
        .map(|f| f.contains(PageTableFlags::DIRTY))
        .unwrap_or(false)
}

pub fn pml4_is_accessed(mapper: &OffsetPageTable<'static>, va: VirtAddr) -> bool {
    leaf_flags(mapper, va)
        .map(|f| f.contains(PageTableFlags::ACCESSED))
        .unwrap_or(false)
}

fn set_leaf_flag(mapper: &mut OffsetPageTable<'static>, va: VirtAddr, flag: PageTableFlags, value: bool) {
    let phys_offset = mapper.phys_offset();
    let l4: &mut PageTable = mapper.level_4_table_mut();
    let l4e = &l4[va_index(va, 3)];
    if !l4e.flags().contains(PageTableFlags::PRESENT) {
        return;
    }
    let l3_addr = l4e.addr();
    let l3: &mut PageTable = unsafe { &mut *(phys_offset + l3_addr.as_u64()).as_mut_ptr() };
    let l3e = &l3[va_index(va, 2)];
    if !l3e.flags().contains(PageTableFlags::PRESENT) {
        return;
    }
    let l2_addr = l3e.addr();
    let l2: &mut PageTable = unsafe { &mut *(phys_offset + l2_addr.as_u64()).as_mut_ptr() };
    let l2e = &l2[va_index(va, 1)];
    if !l2e.flags().contains(PageTableFlags::PRESENT) {
        return;
    }
    let l1_addr = l2e.addr();
    let l1: &mut PageTable = unsafe { &mut *(phys_offset + l1_addr.as_u64()).as_mut_ptr() };
    let entry = &mut l1[va_index(va, 0)];
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return;
    }
    let mut flags = entry.flags();
    flags.set(flag, value);
    let frame = entry.frame().unwrap();
    entry.set_frame(frame, flags);
}

pub fn pml4_set_dirty(mapper: &mut OffsetPageTable<'static>, va: VirtAddr, value: bool) {
    set_leaf_flag(mapper, va, PageTableFlags::DIRTY, value);
}

pub fn pml4_set_accessed(mapper: &mut OffsetPageTable<'static>, va: VirtAddr, value: bool) {
    set_leaf_flag(mapper, va, PageTableFlags::ACCESSED, value);
}

/// Invokes `visitor(va, frame)` for every present user-half leaf page.
/// Aborts and returns `false` on the first `false` result, matching
/// `pml4_for_each` in spec.md 4.1.
pub fn pml4_for_each(
    mapper: &OffsetPageTable<'static>,
    mut visitor: impl FnMut(VirtAddr, PhysFrame) -> bool,
) -> bool {
    let phys_offset = mapper.phys_offset();
    let l4 = mapper.level_4_table();
    for (i4, e4) in l4.iter().enumerate().take(256) {
        if !e4.flags().contains(PageTableFlags::PRESENT) {
            continue;
        }
        let l3: &PageTable = unsafe { &*(phys_offset + e4.addr().as_u64()).as_ptr() };
        for (i3, e3) in l3.iter().enumerate() {
            if !e3.flags().contains(PageTableFlags::PRESENT) {
                continue;
            }
            let l2: &PageTable = unsafe { &*(phys_offset + e3.addr().as_u64()).as_ptr() };
            for (i2, e2) in l2.iter().enumerate() {
                if !e2.flags().contains(PageTableFlags::PRESENT) {
                    continue;
                }
                let l1: &PageTable = unsafe { &*(phys_offset + e2.addr().as_u64()).as_ptr() };
                for (i1, e1) in l1.iter().enumerate() {
                    if !e1.flags().contains(PageTableFlags::PRESENT) {
                        continue;
                    }
                    let va = va_from_indices(i4, i3, i2, i1);
                    if !visitor(va, e1.frame().unwrap()) {
                        return false;
                    }
                }
            }
        }
    }
    true
}

fn va_from_indices(i4: usize, i3: usize, i2: usize, i1: usize) -> VirtAddr {
    let addr = ((i4 as u64) << 39) | ((i3 as u64) << 30) | ((i2 as u64) << 21) | ((i1 as u64) << 12);
    VirtAddr::new(addr)
}

#[allow(dead_code)]
pub fn collect_present_user_frames(mapper: &OffsetPageTable<'static>) -> Vec<(VirtAddr, PhysFrame)> {
    let mut out = Vec::new();
    pml4_for_each(mapper, |va, frame| {
        out.push((va, frame));
        true
    });
    out
}
