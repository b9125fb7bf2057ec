//! Memory-mapped files (spec.md 4.9), grounded in
//! `original_source/vm/file.c`'s `do_mmap`/`do_munmap`.

use alloc::sync::Arc;
use x86_64::structures::paging::{Page as HwPage, PageSize, Size4KiB};
use x86_64::VirtAddr;

use crate::filesystem::vfs::{FileType, Inode};
use crate::memory::PalFlags;
use crate::user::UserProcess;
use crate::vm::page::{FileBacking, Page};
use crate::USER_PMM;

#[derive(Debug)]
pub enum MmapError {
    InvalidArgs,
    BadFd,
    Overlap,
    RegistrationFailed,
}

const PAGE_SIZE: u64 = Size4KiB::SIZE;

/// Registers a `FILE` `UNINIT` descriptor per page covering `length`,
/// backed by a private duplicate of `fd`'s inode (spec.md 4.9).
pub fn mmap(
    process: &mut UserProcess,
    addr: VirtAddr,
    length: usize,
    writable: bool,
    fd: u32,
    offset: u64,
) -> Result<VirtAddr, MmapError> {
    if addr.is_null() || addr.as_u64() % PAGE_SIZE != 0 || length == 0 || offset % PAGE_SIZE != 0 {
        return Err(MmapError::InvalidArgs);
    }

    let descriptor = process.files.get(&fd).ok_or(MmapError::BadFd)?;
    let inode = descriptor.read().inode.clone();
    if inode.file_type != FileType::File || inode.size == 0 {
        return Err(MmapError::BadFd);
    }

    let num_pages = (length as u64).div_ceil(PAGE_SIZE);

    // Must not overlap existing SPT entries or the stack.
    if addr.as_u64() + num_pages * PAGE_SIZE > process.stack_bottom.as_u64() {
        return Err(MmapError::Overlap);
    }
    for i in 0..num_pages {
        let va = addr + i * PAGE_SIZE;
        if process.spt.find_page(va).is_some() {
            return Err(MmapError::Overlap);
        }
    }

    let mut registered = alloc::vec::Vec::new();
    for i in 0..num_pages {
        let va = addr + i * PAGE_SIZE;
        let page_offset = offset + i * PAGE_SIZE;
        let read_bytes = file_read_bytes_at(&inode, page_offset);

        let page = Page::new_uninit_file(
            va,
            writable,
            FileBacking {
                inode: Arc::clone(&inode),
                offset: page_offset,
                read_bytes: read_bytes as u32,
                zero_bytes: (PAGE_SIZE - read_bytes) as u32,
                page_off: 0,
            },
        );

        if process.spt.insert_page(page).is_err() {
            let mut pmm = USER_PMM.get().unwrap().lock();
            for va in registered {
                process.spt.remove_page(va, &mut process.mapper, &mut pmm);
            }
            return Err(MmapError::RegistrationFailed);
        }
        registered.push(va);
    }

    process.mmaps.push((addr, num_pages as usize));
    Ok(addr)
}

fn file_read_bytes_at(inode: &Inode, offset: u64) -> u64 {
    if offset >= inode.size as u64 {
        0
    } else {
        (inode.size as u64 - offset).min(PAGE_SIZE)
    }
}

/// Writes back dirty pages and destroys every descriptor covering the
/// mapping that started at `addr`.
pub fn munmap(process: &mut UserProcess, addr: VirtAddr) {
    let Some(index) = process.mmaps.iter().position(|(a, _)| *a == addr) else {
        return;
    };
    let (addr, num_pages) = process.mmaps.remove(index);

    let mut pmm = USER_PMM.get().unwrap().lock();
    for i in 0..num_pages as u64 {
        let va = addr + i * PAGE_SIZE;
        process.spt.remove_page(va, &mut process.mapper, &mut pmm);
    }
    let _ = HwPage::<Size4KiB>::containing_address(addr); // page-rounding used above
}
