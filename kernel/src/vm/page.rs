//! Page descriptors (spec.md 3, 4.4).
//!
//! `UNINIT`/`ANON`/`FILE` are represented as a tagged enum rather than a
//! table of function pointers per descriptor (spec.md 9, "Polymorphic
//! pages"): `swap_in`/`swap_out`/`destroy` dispatch on `PageKind` and an
//! `UNINIT` page's first fault transmutes `kind` in place into its target
//! variant.

use alloc::sync::Arc;
use x86_64::structures::paging::{OffsetPageTable, PageSize, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

use crate::filesystem::vfs::{Filesystem, Inode};
use crate::memory::{PalFlags, PhysicalMemoryManager};
use crate::pagetable;
use crate::VFS;

/// File-backed region metadata, shared by `UNINIT(File)` and `FILE`
/// descriptors (spec.md 3: "carries `{file, offset, read_bytes,
/// zero_bytes}`").
#[derive(Clone)]
pub struct FileBacking {
    pub inode: Arc<Inode>,
    pub offset: u64,
    pub read_bytes: u32,
    pub zero_bytes: u32,
    /// Byte offset within the page the read region starts at. Nonzero only
    /// for a `PT_LOAD` segment's first page when `p_vaddr` isn't page
    /// aligned: the bytes before it are zero-filled padding, not file data
    /// (spec.md 4.5 step 6).
    pub page_off: u32,
}

/// The eventual shape an `UNINIT` page will take once faulted in.
#[derive(Clone)]
pub enum UninitTarget {
    Anon { stack: bool },
    File(FileBacking),
}

pub enum PageKind {
    Uninit(UninitTarget),
    Anon { stack: bool },
    File { backing: FileBacking, dirty: bool },
}

/// One page-aligned user virtual address's supplemental metadata.
pub struct Page {
    pub va: VirtAddr,
    pub writable: bool,
    pub kind: PageKind,
    pub frame: Option<PhysFrame>,
}

impl Page {
    pub fn new_uninit_anon(va: VirtAddr, writable: bool, stack: bool) -> Page {
        Page {
            va,
            writable,
            kind: PageKind::Uninit(UninitTarget::Anon { stack }),
            frame: None,
        }
    }

    pub fn new_uninit_file(va: VirtAddr, writable: bool, backing: FileBacking) -> Page {
        Page {
            va,
            writable,
            kind: PageKind::Uninit(UninitTarget::File(backing)),
            frame: None,
        }
    }

    /// Materializes an already-allocated anonymous page directly (used for
    /// the first user-stack page, and for stack-growth faults, which need a
    /// zeroed frame immediately rather than a deferred initializer).
    pub fn new_anon(va: VirtAddr, writable: bool, stack: bool) -> Page {
        Page {
            va,
            writable,
            kind: PageKind::Anon { stack },
            frame: None,
        }
    }

    pub fn is_stack(&self) -> bool {
        match &self.kind {
            PageKind::Anon { stack } => *stack,
            PageKind::Uninit(UninitTarget::Anon { stack }) => *stack,
            _ => false,
        }
    }

    /// Obtains a frame, runs the variant's swap-in, and installs the PTE.
    /// This is `vm_claim_page`'s per-descriptor half (spec.md 4.3).
    pub fn swap_in(
        &mut self,
        mapper: &mut OffsetPageTable<'static>,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<(), ()> {
        if self.frame.is_some() {
            return Ok(());
        }

        match &self.kind {
            PageKind::Uninit(UninitTarget::Anon { stack }) => {
                let frame = pmm.alloc(PalFlags::USER | PalFlags::ZERO).ok_or(())?;
                self.kind = PageKind::Anon { stack: *stack };
                self.frame = Some(frame);
            }
            PageKind::Uninit(UninitTarget::File(backing)) => {
                let frame = pmm.alloc(PalFlags::USER | PalFlags::ZERO).ok_or(())?;
                load_file_backing(mapper, frame, backing);
                self.kind = PageKind::File {
                    backing: backing.clone(),
                    dirty: false,
                };
                self.frame = Some(frame);
            }
            PageKind::Anon { .. } => {
                let frame = pmm.alloc(PalFlags::USER | PalFlags::ZERO).ok_or(())?;
                self.frame = Some(frame);
            }
            PageKind::File { backing, .. } => {
                let frame = pmm.alloc(PalFlags::USER | PalFlags::ZERO).ok_or(())?;
                load_file_backing(mapper, frame, backing);
                self.frame = Some(frame);
            }
        }

        let frame = self.frame.unwrap();
        pagetable::pml4_set_page(mapper, self.va, frame, self.writable, false, pmm)
            .map_err(|_| ())?;
        Ok(())
    }

    /// Writes back a dirty file-backed page and clears its PTE. Anonymous
    /// pages have no swap device in this build (spec.md Non-goals: no
    /// swap-to-disk), so swap-out for them is a no-op beyond PTE teardown.
    pub fn swap_out(&mut self, mapper: &mut OffsetPageTable<'static>) {
        if let PageKind::File { backing, .. } = &self.kind {
            if pagetable::pml4_is_dirty(mapper, self.va) {
                write_back(backing, mapper, self.frame);
            }
        }
        pagetable::pml4_clear_page(mapper, self.va);
        self.frame = None;
    }

    /// Tears down this descriptor for good: write back if dirty and
    /// file-backed, clear the PTE, release the frame.
    pub fn destroy(
        &mut self,
        mapper: &mut OffsetPageTable<'static>,
        pmm: &mut PhysicalMemoryManager,
    ) {
        if let PageKind::File { backing, .. } = &self.kind {
            if self.frame.is_some() && pagetable::pml4_is_dirty(mapper, self.va) {
                write_back(backing, mapper, self.frame);
            }
        }
        if let Some(frame) = pagetable::pml4_clear_page(mapper, self.va) {
            pmm.free(frame);
        } else if let Some(frame) = self.frame.take() {
            pmm.free(frame);
        }
        self.frame = None;
    }
}

fn load_file_backing(mapper: &OffsetPageTable<'static>, frame: PhysFrame, backing: &FileBacking) {
    let dst = unsafe {
        core::slice::from_raw_parts_mut(
            (mapper.phys_offset() + frame.start_address().as_u64()).as_mut_ptr::<u8>(),
            Size4KiB::SIZE as usize,
        )
    };
    let vfs = VFS.get().unwrap();
    let page_off = backing.page_off as usize;
    let read_bytes = backing.read_bytes as usize;
    dst[..page_off].fill(0);
    let _ = vfs.read(
        backing.inode.clone(),
        backing.offset,
        &mut dst[page_off..page_off + read_bytes],
    );
    dst[page_off + read_bytes..].fill(0);
}

fn write_back(backing: &FileBacking, mapper: &OffsetPageTable<'static>, frame: Option<PhysFrame>) {
    let Some(frame) = frame else { return };
    let page_off = backing.page_off as usize;
    let read_bytes = backing.read_bytes as usize;
    let src = unsafe {
        core::slice::from_raw_parts(
            (mapper.phys_offset() + frame.start_address().as_u64()).as_ptr::<u8>(),
            Size4KiB::SIZE as usize,
        )
    };
    let vfs = VFS.get().unwrap();
    let _ = vfs.write(
        backing.inode.clone(),
        backing.offset,
        &src[page_off..page_off + read_bytes],
    );
}
