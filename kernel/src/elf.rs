//! Static ELF64 executable loading (spec.md 4.5), grounded in
//! `original_source/userprog/process.c`'s `load`/`validate_segment` and the
//! teacher's own (now superseded) eager loader in `user/mod.rs`.
//!
//! Segments are never copied in eagerly: each `PT_LOAD` page is registered
//! as an `UNINIT(File)` descriptor in the process's supplemental page table
//! and only materialized on first fault (spec.md 4.3 `vm_claim_page`).

use alloc::sync::Arc;
use alloc::vec::Vec;

use x86_64::structures::paging::{OffsetPageTable, Page as HwPage, PageSize, Size4KiB};
use x86_64::VirtAddr;

use crate::filesystem::vfs::Inode;
use crate::user::syscalls::KERN_BASE;
use crate::vm::{FileBacking, Page as VmPage, SupplementalPageTable};

#[derive(Debug)]
pub enum LoadingError {
    InvalidHeader,
    Unsupported,
}

#[derive(Debug)]
#[repr(C)]
struct ProgramHeaderEntry {
    segment_type: u64, // p_type (low 32 bits) | p_flags (high 32 bits)
    offset: u64,
    virtual_address: u64,
    unused: u64, // p_paddr
    image_size: u64,
    mem_size: u64,
    align: u64,
}

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_SHLIB: u32 = 5;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;
const PGSIZE: u64 = Size4KiB::SIZE;

/// Caps `e_phnum`; an ELF naming more headers than this is rejected outright
/// rather than walked (spec.md 8: "An ELF with e_phnum = 1025 is rejected").
const MAX_PROGRAM_HEADERS: usize = 1024;

pub struct LoadedImage {
    pub entry: VirtAddr,
    pub brk_initial: VirtAddr,
}

/// Validates the header, rejects dynamic/interpreted executables, and
/// registers one `UNINIT(File)` descriptor per `PT_LOAD` page.
pub fn load(
    binary: &[u8],
    inode: Arc<Inode>,
    mapper: &mut OffsetPageTable<'static>,
    spt: &mut SupplementalPageTable,
) -> Result<LoadedImage, LoadingError> {
    // Clear whatever the address space's lower (user) half held before.
    for entry in mapper.level_4_table_mut().iter_mut().take(256) {
        entry.set_unused();
    }

    let header = validate_header(binary)?;
    let entry = header.entry;
    let header_start = header.header_start;
    let header_num = header.header_num;
    let header_size = header.header_size;

    let headers: Vec<&ProgramHeaderEntry> = (0..header_num)
        .map(|i| header_start + header_size * i)
        .map(|offset| unsafe {
            &*(binary[offset..offset + size_of::<ProgramHeaderEntry>()].as_ptr()
                as *const ProgramHeaderEntry)
        })
        .collect();

    for header in &headers {
        let segment_type = header.segment_type as u32;
        if matches!(segment_type, PT_DYNAMIC | PT_INTERP | PT_SHLIB) {
            return Err(LoadingError::Unsupported);
        }
    }

    let mut brk_initial = VirtAddr::new(0);

    for header in &headers {
        if header.segment_type as u32 != PT_LOAD {
            continue;
        }

        validate_segment(header, binary.len())?;

        let segment_flags = (header.segment_type >> 32) as u32;
        let writable = (segment_flags & 2) > 0;

        let seg_start = VirtAddr::new(header.virtual_address);
        let seg_end = VirtAddr::new(header.virtual_address + header.mem_size);
        brk_initial = brk_initial.max(seg_end.align_up(Size4KiB::SIZE));

        let first_page = HwPage::<Size4KiB>::containing_address(seg_start);
        let last_page = HwPage::<Size4KiB>::containing_address(seg_end - 1u64);

        // Leading zero-padding on the segment's first page when `p_vaddr`
        // isn't page aligned; `validate_segment` already guaranteed `p_offset`
        // shares the same intra-page offset, so this many bytes of file data
        // precede the page too and must not be read.
        let first_page_off = (seg_start.as_u64() - first_page.start_address().as_u64()) as u32;

        let mut file_pos = header.offset;
        let mut file_remaining = header.image_size;

        for (i, page) in HwPage::range_inclusive(first_page, last_page).enumerate() {
            let page_va = page.start_address();
            let page_off = if i == 0 { first_page_off } else { 0 };

            let space = Size4KiB::SIZE as u32 - page_off;
            let read_bytes = (file_remaining as u32).min(space);

            let descriptor = VmPage::new_uninit_file(
                page_va,
                writable,
                FileBacking {
                    inode: Arc::clone(&inode),
                    offset: file_pos,
                    read_bytes,
                    zero_bytes: Size4KiB::SIZE as u32 - page_off - read_bytes,
                    page_off,
                },
            );

            spt.insert_page(descriptor).map_err(|_| LoadingError::InvalidHeader)?;

            file_pos += read_bytes as u64;
            file_remaining -= read_bytes as u64;
        }
    }

    Ok(LoadedImage {
        entry: VirtAddr::new(entry),
        brk_initial,
    })
}

struct ParsedHeader {
    entry: u64,
    header_start: usize,
    header_num: usize,
    header_size: usize,
}

/// Pure header validation, split out of `load` so it can run without a page
/// table or allocator (host-target tests, and `tests::run_in_kernel_tests`).
fn validate_header(binary: &[u8]) -> Result<ParsedHeader, LoadingError> {
    if binary.len() < 0x40
        || binary[0x0..0x4] != *b"\x7fELF"
        || binary[0x4] != 2 // ELFCLASS64
        || binary[0x5] != 1 // ELFDATA2LSB
    {
        return Err(LoadingError::InvalidHeader);
    }

    let e_type = u16::from_ne_bytes(binary[0x10..0x12].try_into().unwrap());
    if e_type != ET_EXEC {
        return Err(LoadingError::Unsupported);
    }

    let e_machine = u16::from_ne_bytes(binary[0x12..0x14].try_into().unwrap());
    if e_machine != EM_X86_64 {
        return Err(LoadingError::Unsupported);
    }

    let e_version = u32::from_ne_bytes(binary[0x14..0x18].try_into().unwrap());
    if e_version != 1 {
        return Err(LoadingError::InvalidHeader);
    }

    let entry = u64::from_ne_bytes(binary[0x18..0x20].try_into().unwrap());
    let header_start = u64::from_ne_bytes(binary[0x20..0x28].try_into().unwrap()) as usize;
    let header_size = u16::from_ne_bytes(binary[0x36..0x38].try_into().unwrap()) as usize;
    let header_num = u16::from_ne_bytes(binary[0x38..0x3A].try_into().unwrap()) as usize;

    if header_size < size_of::<ProgramHeaderEntry>() || header_num > MAX_PROGRAM_HEADERS {
        return Err(LoadingError::InvalidHeader);
    }

    Ok(ParsedHeader {
        entry,
        header_start,
        header_num,
        header_size,
    })
}

/// Validates one `PT_LOAD` header against the on-disk image and the user
/// half of the address space, independent of any page table (spec.md 4.5
/// step 5).
fn validate_segment(header: &ProgramHeaderEntry, binary_len: usize) -> Result<(), LoadingError> {
    let page_mask = PGSIZE - 1;
    if header.offset & page_mask != header.virtual_address & page_mask {
        return Err(LoadingError::InvalidHeader);
    }

    let file_end = header
        .offset
        .checked_add(header.image_size)
        .ok_or(LoadingError::InvalidHeader)?;
    if file_end > binary_len as u64 {
        return Err(LoadingError::InvalidHeader);
    }

    if header.mem_size < header.image_size || header.mem_size == 0 {
        return Err(LoadingError::InvalidHeader);
    }

    if header.virtual_address < PGSIZE {
        // Rejects any segment overlapping page 0 outright, rather than
        // silently leaving its lowest page unmapped (spec.md 8: a
        // `p_vaddr = PGSIZE - 1` segment is rejected).
        return Err(LoadingError::InvalidHeader);
    }

    let seg_end = header
        .virtual_address
        .checked_add(header.mem_size)
        .ok_or(LoadingError::InvalidHeader)?;
    if seg_end > KERN_BASE {
        return Err(LoadingError::InvalidHeader);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(e_type: u16, phnum: u16) -> [u8; 0x40] {
        let mut buf = [0u8; 0x40];
        buf[0..4].copy_from_slice(b"\x7fELF");
        buf[4] = 2;
        buf[5] = 1;
        buf[0x10..0x12].copy_from_slice(&e_type.to_ne_bytes());
        buf[0x12..0x14].copy_from_slice(&EM_X86_64.to_ne_bytes());
        buf[0x14..0x18].copy_from_slice(&1u32.to_ne_bytes());
        buf[0x18..0x20].copy_from_slice(&0x1000u64.to_ne_bytes());
        buf[0x20..0x28].copy_from_slice(&0x40u64.to_ne_bytes());
        buf[0x36..0x38].copy_from_slice(&(size_of::<ProgramHeaderEntry>() as u16).to_ne_bytes());
        buf[0x38..0x3A].copy_from_slice(&phnum.to_ne_bytes());
        buf
    }

    fn segment(offset: u64, vaddr: u64, filesz: u64, memsz: u64) -> ProgramHeaderEntry {
        ProgramHeaderEntry {
            segment_type: PT_LOAD as u64,
            offset,
            virtual_address: vaddr,
            unused: 0,
            image_size: filesz,
            mem_size: memsz,
            align: PGSIZE,
        }
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(matches!(validate_header(&[0u8; 10]), Err(LoadingError::InvalidHeader)));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = minimal_header(ET_EXEC, 1);
        buf[0] = 0;
        assert!(matches!(validate_header(&buf), Err(LoadingError::InvalidHeader)));
    }

    #[test]
    fn rejects_non_exec_type() {
        assert!(matches!(validate_header(&minimal_header(3, 1)), Err(LoadingError::Unsupported)));
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut buf = minimal_header(ET_EXEC, 1);
        buf[0x12..0x14].copy_from_slice(&0x03u16.to_ne_bytes()); // EM_386
        assert!(matches!(validate_header(&buf), Err(LoadingError::Unsupported)));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut buf = minimal_header(ET_EXEC, 1);
        buf[0x14..0x18].copy_from_slice(&0u32.to_ne_bytes());
        assert!(matches!(validate_header(&buf), Err(LoadingError::InvalidHeader)));
    }

    #[test]
    fn rejects_excessive_program_headers() {
        assert!(matches!(
            validate_header(&minimal_header(ET_EXEC, 1025)),
            Err(LoadingError::InvalidHeader)
        ));
    }

    #[test]
    fn accepts_well_formed_header() {
        let parsed = validate_header(&minimal_header(ET_EXEC, 3)).unwrap();
        assert_eq!(parsed.entry, 0x1000);
        assert_eq!(parsed.header_num, 3);
        assert_eq!(parsed.header_size, size_of::<ProgramHeaderEntry>());
    }

    #[test]
    fn validate_segment_accepts_page_aligned_segment() {
        let seg = segment(0x1000, 0x40_0000, 0x200, 0x200);
        assert!(validate_segment(&seg, 0x2000).is_ok());
    }

    #[test]
    fn validate_segment_rejects_mismatched_intra_page_offsets() {
        let seg = segment(0x1000, 0x40_0010, 0x200, 0x200);
        assert!(validate_segment(&seg, 0x2000).is_err());
    }

    #[test]
    fn validate_segment_accepts_matching_intra_page_offsets() {
        let seg = segment(0x1010, 0x40_0010, 0x200, 0x200);
        assert!(validate_segment(&seg, 0x2000).is_ok());
    }

    #[test]
    fn validate_segment_rejects_offset_past_file_end() {
        let seg = segment(0x1000, 0x40_0000, 0x200, 0x200);
        assert!(validate_segment(&seg, 0x1100).is_err());
    }

    #[test]
    fn validate_segment_rejects_memsz_smaller_than_filesz() {
        let seg = segment(0x1000, 0x40_0000, 0x200, 0x100);
        assert!(validate_segment(&seg, 0x2000).is_err());
    }

    #[test]
    fn validate_segment_rejects_zero_memsz() {
        let seg = segment(0x1000, 0x40_0000, 0, 0);
        assert!(validate_segment(&seg, 0x2000).is_err());
    }

    #[test]
    fn validate_segment_rejects_page_zero_overlap() {
        let seg = segment(0, PGSIZE - 1, 0x10, 0x10);
        assert!(validate_segment(&seg, 0x2000).is_err());
    }

    #[test]
    fn validate_segment_rejects_kernel_half_overlap() {
        let seg = segment(0x1000, KERN_BASE - 0x100, 0x200, 0x200);
        assert!(validate_segment(&seg, 0x2000).is_err());
    }

    #[test]
    fn validate_segment_rejects_vaddr_overflow() {
        let seg = segment(0x1000, u64::MAX - 0x10, 0x200, 0x200);
        assert!(validate_segment(&seg, 0x2000).is_err());
    }
}
