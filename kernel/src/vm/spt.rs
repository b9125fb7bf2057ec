//! Supplemental page table (spec.md 4.3).

use alloc::collections::btree_map::BTreeMap;
use x86_64::structures::paging::{OffsetPageTable, Page as HwPage, Size4KiB};
use x86_64::VirtAddr;

use crate::memory::PhysicalMemoryManager;
use crate::vm::page::Page;

pub struct SupplementalPageTable {
    pages: BTreeMap<VirtAddr, Page>,
}

fn page_key(va: VirtAddr) -> VirtAddr {
    HwPage::<Size4KiB>::containing_address(va).start_address()
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        SupplementalPageTable {
            pages: BTreeMap::new(),
        }
    }

    pub fn find_page(&self, va: VirtAddr) -> Option<&Page> {
        self.pages.get(&page_key(va))
    }

    pub fn find_page_mut(&mut self, va: VirtAddr) -> Option<&mut Page> {
        self.pages.get_mut(&page_key(va))
    }

    /// Inserts a fresh descriptor. Fails (returns `Err`) if the key is
    /// already present, per spec.md 4.3.
    pub fn insert_page(&mut self, page: Page) -> Result<(), ()> {
        let key = page_key(page.va);
        if self.pages.contains_key(&key) {
            return Err(());
        }
        self.pages.insert(key, page);
        Ok(())
    }

    /// Removes and destroys the descriptor at `va`, if present.
    pub fn remove_page(
        &mut self,
        va: VirtAddr,
        mapper: &mut OffsetPageTable<'static>,
        pmm: &mut PhysicalMemoryManager,
    ) {
        if let Some(mut page) = self.pages.remove(&page_key(va)) {
            page.destroy(mapper, pmm);
        }
    }

    pub fn highest_stack_page(&self) -> Option<VirtAddr> {
        self.pages
            .values()
            .filter(|p| p.is_stack())
            .map(|p| p.va)
            .min()
    }

    /// Destroys every descriptor, writing back dirty file-backed pages
    /// first (spec.md 4.3 `spt_kill`).
    pub fn kill(&mut self, mapper: &mut OffsetPageTable<'static>, pmm: &mut PhysicalMemoryManager) {
        for (_, mut page) in core::mem::take(&mut self.pages) {
            page.destroy(mapper, pmm);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VirtAddr, &Page)> {
        self.pages.iter()
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_duplicate_key() {
        let mut spt = SupplementalPageTable::new();
        let va = VirtAddr::new(0x1000);
        spt.insert_page(Page::new_uninit_anon(va, true, false)).unwrap();
        assert!(spt.insert_page(Page::new_uninit_anon(va, true, false)).is_err());
    }

    #[test]
    fn lookups_are_keyed_by_containing_page_not_exact_address() {
        let mut spt = SupplementalPageTable::new();
        let page_start = VirtAddr::new(0x4000);
        spt.insert_page(Page::new_uninit_anon(page_start, true, false)).unwrap();

        let mid_page = VirtAddr::new(0x4123);
        assert!(spt.find_page(mid_page).is_some());
        assert_eq!(spt.find_page(mid_page).unwrap().va, page_start);

        let next_page = VirtAddr::new(0x5000);
        assert!(spt.find_page(next_page).is_none());
    }

    #[test]
    fn highest_stack_page_ignores_non_stack_descriptors() {
        let mut spt = SupplementalPageTable::new();
        spt.insert_page(Page::new_uninit_anon(VirtAddr::new(0x1000), true, false))
            .unwrap();
        assert!(spt.highest_stack_page().is_none());

        spt.insert_page(Page::new_uninit_anon(VirtAddr::new(0x7fff_fffe_0000), true, true))
            .unwrap();
        spt.insert_page(Page::new_uninit_anon(VirtAddr::new(0x7fff_ffff_0000), true, true))
            .unwrap();

        assert_eq!(
            spt.highest_stack_page(),
            Some(VirtAddr::new(0x7fff_fffe_0000))
        );
    }

    #[test]
    fn find_page_mut_observes_same_key_as_find_page() {
        let mut spt = SupplementalPageTable::new();
        let va = VirtAddr::new(0x9000);
        spt.insert_page(Page::new_uninit_anon(va, false, false)).unwrap();

        spt.find_page_mut(VirtAddr::new(0x9abc)).unwrap().writable = true;
        assert!(spt.find_page(va).unwrap().writable);
    }
}

/// Duplicates every descriptor from `src` into `dst` for fork (spec.md 4.3
/// `spt_copy`, spec.md 4.7 step 3). Un-faulted `UNINIT` descriptors are
/// copied by description only (the child will materialize its own frame on
/// first access); already-materialized pages are copied frame-for-frame so
/// the parent and child addresses spaces are independent from the moment
/// fork returns (spec.md 8, universal invariant 2).
pub fn copy(
    dst: &mut SupplementalPageTable,
    src: &SupplementalPageTable,
    dst_mapper: &mut OffsetPageTable<'static>,
    src_mapper: &OffsetPageTable<'static>,
    pmm: &mut PhysicalMemoryManager,
) -> Result<(), ()> {
    use crate::memory::PalFlags;
    use x86_64::structures::paging::PageSize;

    for (_, page) in src.pages.iter() {
        if page.frame.is_none() {
            let cloned = match &page.kind {
                crate::vm::page::PageKind::Uninit(target) => match target {
                    crate::vm::page::UninitTarget::Anon { stack } => {
                        Page::new_uninit_anon(page.va, page.writable, *stack)
                    }
                    crate::vm::page::UninitTarget::File(backing) => {
                        Page::new_uninit_file(page.va, page.writable, backing.clone())
                    }
                },
                crate::vm::page::PageKind::Anon { stack } => {
                    Page::new_uninit_anon(page.va, page.writable, *stack)
                }
                crate::vm::page::PageKind::File { backing, .. } => {
                    Page::new_uninit_file(page.va, page.writable, backing.clone())
                }
            };
            dst.insert_page(cloned)?;
            continue;
        }

        let new_frame = pmm.alloc(PalFlags::USER).ok_or(())?;
        let src_bytes = unsafe {
            core::slice::from_raw_parts(
                (src_mapper.phys_offset() + page.frame.unwrap().start_address().as_u64())
                    .as_ptr::<u8>(),
                Size4KiB::SIZE as usize,
            )
        };
        let dst_bytes = unsafe {
            core::slice::from_raw_parts_mut(
                (dst_mapper.phys_offset() + new_frame.start_address().as_u64()).as_mut_ptr::<u8>(),
                Size4KiB::SIZE as usize,
            )
        };
        dst_bytes.copy_from_slice(src_bytes);

        crate::pagetable::pml4_set_page(dst_mapper, page.va, new_frame, page.writable, false, pmm)
            .map_err(|_| ())?;

        let mut new_page = Page {
            va: page.va,
            writable: page.writable,
            kind: match &page.kind {
                crate::vm::page::PageKind::Anon { stack } => {
                    crate::vm::page::PageKind::Anon { stack: *stack }
                }
                crate::vm::page::PageKind::File { backing, .. } => {
                    crate::vm::page::PageKind::File {
                        backing: backing.clone(),
                        dirty: false,
                    }
                }
                crate::vm::page::PageKind::Uninit(_) => unreachable!(),
            },
            frame: Some(new_frame),
        };
        new_page.frame = Some(new_frame);
        dst.insert_page(new_page)?;
    }
    Ok(())
}
