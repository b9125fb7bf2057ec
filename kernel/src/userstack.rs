//! User stack construction (spec.md 4.6), grounded in
//! `original_source/userprog/process.c`'s `argument_stack`.
//!
//! Unlike the reference, the 16-byte alignment pad is sized to include the
//! fake return address and the argv pointer array *before* it is applied, so
//! the stack pointer `_start` actually receives is aligned — the reference
//! pads only for the argv block and pushes the fake return address
//! afterwards, which can leave it misaligned (spec.md 9). argc is never
//! pushed onto the stack at all: it is handed to `_start` purely in `rdi`,
//! with `rsi` pointing straight at the argv array starting at `rsp + 8`.

use alloc::vec::Vec;

use x86_64::structures::paging::{OffsetPageTable, PageSize, Size4KiB};
use x86_64::VirtAddr;

use crate::memory::PhysicalMemoryManager;
use crate::vm::{Page, SupplementalPageTable};

/// Top of the user address space's stack region. The first page below this
/// is mapped eagerly; further pages are grown on demand (spec.md 4.3).
pub const USER_STACK: VirtAddr = VirtAddr::new(0x7fff_ffff_f000);

/// Byte offsets (from the top of the stack page) of everything `build`
/// writes, computed independently of any page table or frame allocator so
/// the alignment arithmetic can run under the host-target test harness.
struct StackLayout {
    /// Offset to write each arg string at, in original `args` order.
    arg_offsets: Vec<usize>,
    /// Offset of the first argv pointer slot (NULL-terminated array).
    argv_off: usize,
    /// Offset of the fake return address `_start` is entered "under".
    fake_ret_off: usize,
}

fn compute_layout(page_size: usize, args: &[&str]) -> StackLayout {
    let mut off = page_size;
    let mut arg_offsets = Vec::with_capacity(args.len());

    // argv strings, last argument first, each NUL-terminated.
    for arg in args.iter().rev() {
        off -= arg.as_bytes().len() + 1;
        arg_offsets.push(off);
    }
    arg_offsets.reverse();

    let argc = args.len();
    let tail = 8 * (argc + 1) + 8 /* fake return */;
    while (off.wrapping_sub(tail)) % 16 != 0 {
        off -= 1;
    }

    off -= 8 * (argc + 1);
    let argv_off = off;

    off -= 8; // fake return address, never actually returned to
    let fake_ret_off = off;

    StackLayout {
        arg_offsets,
        argv_off,
        fake_ret_off,
    }
}

/// Builds the initial user stack for a freshly loaded executable and
/// returns `(initial rsp, lowest mapped stack address)`.
pub fn build(
    mapper: &mut OffsetPageTable<'static>,
    pmm: &mut PhysicalMemoryManager,
    spt: &mut SupplementalPageTable,
    args: &[&str],
) -> Result<(VirtAddr, VirtAddr), ()> {
    let page_va = USER_STACK - Size4KiB::SIZE;
    let mut page = Page::new_anon(page_va, true, true);
    page.swap_in(mapper, pmm)?;
    let frame = page.frame.ok_or(())?;
    spt.insert_page(page).map_err(|_| ())?;

    let base = mapper.phys_offset() + frame.start_address().as_u64();
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(base.as_mut_ptr::<u8>(), Size4KiB::SIZE as usize)
    };

    let layout = compute_layout(Size4KiB::SIZE as usize, args);

    for (arg, &off) in args.iter().zip(layout.arg_offsets.iter()) {
        let raw = arg.as_bytes();
        bytes[off..off + raw.len()].copy_from_slice(raw);
        bytes[off + raw.len()] = 0;
    }

    for (i, &str_off) in layout.arg_offsets.iter().enumerate() {
        let uaddr = page_va.as_u64() + str_off as u64;
        let slot = layout.argv_off + i * 8;
        bytes[slot..slot + 8].copy_from_slice(&uaddr.to_ne_bytes());
    }
    let null_slot = layout.argv_off + layout.arg_offsets.len() * 8;
    bytes[null_slot..null_slot + 8].copy_from_slice(&0u64.to_ne_bytes());

    bytes[layout.fake_ret_off..layout.fake_ret_off + 8].copy_from_slice(&0u64.to_ne_bytes());

    let rsp = VirtAddr::new(page_va.as_u64() + layout.fake_ret_off as u64);
    Ok((rsp, page_va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_rsp_is_16_byte_aligned() {
        for argc in 0..8 {
            let owned: Vec<alloc::string::String> =
                (0..argc).map(|i| alloc::format!("arg{i}")).collect();
            let args: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
            let layout = compute_layout(Size4KiB::SIZE as usize, &args);
            assert_eq!(
                layout.fake_ret_off % 16,
                0,
                "argc={argc} misaligned fake_ret_off={}",
                layout.fake_ret_off
            );
        }
    }

    #[test]
    fn arg_strings_and_argv_array_do_not_overlap() {
        let args = ["program", "a", "bb", "ccc"];
        let layout = compute_layout(Size4KiB::SIZE as usize, &args);

        let lowest_string_off = *layout.arg_offsets.iter().min().unwrap();
        assert!(layout.argv_off <= lowest_string_off);

        assert_eq!(layout.arg_offsets.len(), args.len());
        for (arg, &off) in args.iter().zip(layout.arg_offsets.iter()) {
            assert!(off + arg.len() < Size4KiB::SIZE as usize);
        }
    }

    #[test]
    fn argv_array_starts_immediately_after_fake_return() {
        let args = ["init"];
        let layout = compute_layout(Size4KiB::SIZE as usize, &args);
        assert_eq!(layout.argv_off, layout.fake_ret_off + 8);
    }

    #[test]
    fn empty_argv_still_aligns() {
        let layout = compute_layout(Size4KiB::SIZE as usize, &[]);
        assert_eq!(layout.fake_ret_off % 16, 0);
        assert!(layout.arg_offsets.is_empty());
    }
}
