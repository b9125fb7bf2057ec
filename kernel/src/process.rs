//! Process lifecycle (spec.md 4.7), grounded in
//! `original_source/userprog/process.c`'s `process_execute`/`process_wait`/
//! `process_exit`.
//!
//! The reference spawns a separate kernel thread to perform loading and
//! blocks the caller on `load_sema` until that thread reports success or
//! failure. This scheduler's `fork`/`exec` run the loader synchronously in
//! the calling thread instead, so `load_sema`'s wait is satisfied the
//! instant the synchronous call returns rather than via a cross-thread
//! post; `wait_sema`/`exit_sema` keep their original meaning since a
//! child's exit and a parent's `wait` genuinely race across scheduler
//! switches.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;
use x86_64::structures::paging::OffsetPageTable;

use crate::filesystem::{self, vfs::Filesystem};
use crate::kernel_log;
use crate::pagetable;
use crate::scheduler;
use crate::user::{FileDescriptor, ProcessTable, UserProcess};
use crate::user::constants::O_RDWR;
use crate::VFS;

/// Creates the first user process from a kernel command-line action and
/// schedules it. Mirrors `process_execute` called on `init.c`'s `-exec`.
/// `mapper` is the boot page table, reused rather than freshly duplicated
/// for this one process, matching `UserProcess::create`'s contract.
pub fn create_initd(mapper: OffsetPageTable<'static>, cmdline: &str) -> Result<u32, ()> {
    let pid = UserProcess::create(mapper);
    reserve_console_fds(pid);
    exec_path(pid, cmdline)?;
    let thread = ProcessTable::get_by_pid(pid).unwrap().lock().thread.clone();
    scheduler::enqueue(thread);
    Ok(pid)
}

/// Binds fd 0 and fd 1 to the console device, the way a shell's children
/// inherit stdin/stdout (spec.md 6). Indices 0/1 are reserved and never
/// handed out by `open()`.
fn reserve_console_fds(pid: u32) {
    let Some(process) = ProcessTable::get_by_pid(pid) else {
        return;
    };
    let vfs = VFS.get().unwrap();
    let Ok(console) = vfs.traverse_fs(vfs.root.clone(), "/dev/console") else {
        return;
    };
    let _ = vfs.open(console.clone());

    let mut process = process.lock();
    for fd in 0..=1 {
        process.files.insert(
            fd,
            Arc::new(RwLock::new(FileDescriptor {
                inode: console.clone(),
                offset: 0,
                flags: O_RDWR,
            })),
        );
    }
}

fn exec_path(pid: u32, cmdline: &str) -> Result<(), ()> {
    let mut parts = cmdline.split_whitespace();
    let path = parts.next().ok_or(())?;
    let args: Vec<&str> = core::iter::once(path).chain(parts).collect();

    let vfs = VFS.get().unwrap();
    let inode = vfs.traverse_fs(vfs.root.clone(), path).map_err(|_| ())?;
    vfs.open(inode.clone()).map_err(|_| ())?;
    let binary = filesystem::read(path).map_err(|_| ())?;

    let process = ProcessTable::get_by_pid(pid).ok_or(())?;
    let mut process = process.lock();
    process
        .execve(&binary, inode, &args, &[])
        .map(|_| ())
        .map_err(|_| ())
}

/// Duplicates `parent_pid`'s address space and file table, queues the
/// child, and records the parent/child relationship (spec.md 4.7 step 2-3).
pub fn fork(parent_pid: u32) -> Result<u32, ()> {
    let parent = ProcessTable::get_by_pid(parent_pid).ok_or(())?;
    let child_pid = {
        let parent = parent.lock();
        parent.fork()?
    };

    parent.lock().children.push(child_pid);

    let child = ProcessTable::get_by_pid(child_pid).unwrap();
    let thread = child.lock().thread.clone();

    // Copy the top of the kernel stack -- the trapframe the syscall entry
    // trampoline built for this `fork()` call -- so the child resumes from
    // the same userspace return site as the parent, with rax forced to 0.
    if let Some(parent_thread) = scheduler::current_thread() {
        let parent_thread = parent_thread.lock();
        let mut thread = thread.lock();

        let src = *parent_thread.kstack.last_chunk::<6>().unwrap();
        thread.kstack.last_chunk_mut::<6>().unwrap().copy_from_slice(&src);

        *thread.kstack.iter_mut().nth_back(6).unwrap() = crate::user::forked_entry as u64;
        thread.context.rsp = thread.kstack.iter().nth_back(6).unwrap() as *const u64 as u64;
    }

    scheduler::enqueue(thread);

    // Loading already succeeded synchronously by the time `fork` returns.
    child.lock().load_sema.up();
    child.lock().load_sema.down();

    Ok(child_pid)
}

/// Replaces the calling process's image (spec.md 4.7 step 4). Does not
/// return to the caller on success: the calling thread's entry point is
/// rewritten to jump straight into the new image.
pub fn exec(pid: u32, cmdline: &str) -> Result<(), ()> {
    exec_path(pid, cmdline)
}

/// Blocks until `child_pid` (which must be a direct child of `pid`) exits,
/// then returns its exit status and forgets it can be waited on again
/// (spec.md 4.7 step 5, step 8 "second wait returns -1").
pub fn wait(pid: u32, child_pid: u32) -> i32 {
    let Some(parent) = ProcessTable::get_by_pid(pid) else {
        return -1;
    };
    let is_child = {
        let mut parent = parent.lock();
        let idx = parent.children.iter().position(|&c| c == child_pid);
        if let Some(idx) = idx {
            parent.children.remove(idx);
            true
        } else {
            false
        }
    };
    if !is_child {
        return -1;
    }

    wait_unconditionally(child_pid)
}

/// Blocks until `child_pid` exits and reaps its status, without checking
/// any parent/child relationship. Used by the kernel command-line `run`
/// action, whose caller is the boot thread rather than a `UserProcess`.
pub fn wait_unconditionally(child_pid: u32) -> i32 {
    let Some(child) = ProcessTable::get_by_pid(child_pid) else {
        return -1;
    };
    child.lock().wait_sema.down();
    let status = child.lock().exit_status.unwrap_or(-1);
    child.lock().exit_sema.up();
    ProcessTable::remove(child_pid);
    status
}

/// Terminates the calling process. Writes back dirty mmap'd pages, frees
/// the address space, reports the exit status to a waiting parent, and
/// acks every still-living child so none of them block forever waiting on
/// a parent that will never call `exit_sema.up()` again (spec.md 9: the
/// reference omits this and leaks the child's wait block).
pub fn exit_current(status: i32) -> ! {
    let pid = crate::user::syscalls::current_process_pid().expect("exit_current: no current process");
    kernel_log!("{}: exit({})", pid, status);

    let process = ProcessTable::get_by_pid(pid).unwrap();
    {
        let mut process = process.lock();
        let mut pmm = crate::USER_PMM.get().unwrap().lock();
        process.spt.kill(&mut process.mapper, &mut pmm);
        process.exit_status = Some(status);

        for &child_pid in process.children.clone().iter() {
            if let Some(child) = ProcessTable::get_by_pid(child_pid) {
                child.lock().exit_sema.up();
            }
        }
    }

    process.lock().wait_sema.up();
    process.lock().exit_sema.down();

    {
        let process = process.lock();
        if process.owns_page_table {
            let cr3_frame = process.cr3_frame;
            let phys_offset = process.mapper.phys_offset();
            drop(process);
            pagetable::activate_kernel_pml4();
            let mut pmm = crate::USER_PMM.get().unwrap().lock();
            unsafe { pagetable::pml4_destroy(phys_offset, cr3_frame, &mut pmm) };
        }
    }

    scheduler::exit_current_thread();
}

#[cfg(test)]
mod tests {
    #[test]
    fn exec_path_splits_program_name_as_argv0() {
        let cmdline = "/bin/echo hello world";
        let mut parts = cmdline.split_whitespace();
        let path = parts.next().unwrap();
        let mut args = core::iter::once(path).chain(parts);
        assert_eq!(args.next(), Some("/bin/echo"));
        assert_eq!(args.next(), Some("hello"));
        assert_eq!(args.next(), Some("world"));
        assert_eq!(args.next(), None);
    }
}
