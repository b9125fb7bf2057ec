//! Page-fault policy (spec.md 4.3).

use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};
use x86_64::VirtAddr;

use crate::user::syscalls::{current_process, current_process_pid};
use crate::userstack::USER_STACK;
use crate::vm::page::Page;
use crate::{debug_println, USER_PMM};

const MAX_STACK_GROWTH: u64 = 1024 * 1024; // 1 MiB below USER_STACK, per spec.md 4.3

/// Runs on every `#PF`. Either claims/grows a page and resumes, or
/// terminates the faulting process with status -1.
pub fn handle(stack_frame: &InterruptStackFrame, fault_addr: VirtAddr, error_code: PageFaultErrorCode) {
    let user_mode = error_code.contains(PageFaultErrorCode::USER_MODE);
    let rsp = VirtAddr::new(stack_frame.stack_pointer.as_u64());

    // "Kernel-mode faults on a user address are treated identically if rsp
    // was captured in the trap frame; otherwise the kernel panics."
    if !user_mode && fault_addr.as_u64() >= crate::user::syscalls::KERN_BASE {
        panic!(
            "[CPU Exception] Page Fault on address {:?}, {:?}\n{:?}",
            fault_addr, error_code, stack_frame
        );
    }

    let Some(pid) = current_process_pid() else {
        panic!(
            "[CPU Exception] Page Fault with no current process on address {:?}",
            fault_addr
        );
    };
    let process = current_process();
    let mut process = process.lock();

    let mut pmm = USER_PMM.get().unwrap().lock();

    if let Some(page) = process.spt.find_page_mut(fault_addr) {
        if page.swap_in(&mut process.mapper, &mut pmm).is_ok() {
            return;
        }
        debug_println!("vm::fault: swap_in failed for pid {} at {:?}", pid, fault_addr);
    } else if is_stack_growth(fault_addr, rsp, process.stack_bottom) {
        let page_va = x86_64::structures::paging::Page::<x86_64::structures::paging::Size4KiB>::containing_address(fault_addr)
            .start_address();
        let mut page = Page::new_anon(page_va, true, true);
        if page.swap_in(&mut process.mapper, &mut pmm).is_ok() {
            process.stack_bottom = page_va;
            let _ = process.spt.insert_page(page);
            return;
        }
    }

    drop(pmm);
    drop(process);
    debug_println!("vm::fault: illegal access by pid {} at {:?}", pid, fault_addr);
    crate::process::exit_current(-1);
}

fn is_stack_growth(fault_addr: VirtAddr, rsp: VirtAddr, stack_bottom: VirtAddr) -> bool {
    if fault_addr >= USER_STACK {
        return false;
    }
    if fault_addr.as_u64() + 4096 < stack_bottom.as_u64() {
        return false;
    }
    if fault_addr.as_u64() + MAX_STACK_GROWTH < USER_STACK.as_u64() {
        return false;
    }
    // within one page below rsp - 8
    rsp.as_u64().saturating_sub(8).saturating_sub(fault_addr.as_u64()) < 4096
        || fault_addr < rsp
}
