use core::arch::naked_asm;
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::borrow::ToOwned;
use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use alloc::sync::Arc;
use conquer_once::spin::OnceCell;
use spin::RwLock;
use spin::mutex::Mutex;
use syscalls::syscall_ret;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;
use x86_64::{
    VirtAddr,
    structures::paging::{Mapper, OffsetPageTable, Page, PageTableFlags, Size4KiB},
};

use crate::elf::{self, LoadingError};
use crate::pagetable;
use crate::scheduler::Thread;
use crate::sync::Semaphore;
use crate::vm::{self, SupplementalPageTable};
use crate::{USER_PMM, debug_println, filesystem::vfs::Inode};

#[allow(dead_code)]
pub mod constants;

pub mod syscalls;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
static PROCESS_TABLE: OnceCell<ProcessTable> = OnceCell::uninit();

pub struct ProcessTable {
    /// Maps PID to user process
    processes: RwLock<BTreeMap<u32, Arc<Mutex<UserProcess>>>>,
}

impl ProcessTable {
    pub fn init() {
        PROCESS_TABLE.init_once(|| ProcessTable {
            processes: RwLock::new(BTreeMap::new()),
        });
    }

    /// Gets a process by its PID
    /// # Panics
    /// Panics if ProcessTable::init() has not been called.
    ///
    /// Most references to processes should be by PID. Holding this Arc<> for too long
    /// will delay process destruction, so drop this as soon as possible.
    pub fn get_by_pid(pid: u32) -> Option<Arc<Mutex<UserProcess>>> {
        PROCESS_TABLE
            .get()
            .expect("Expected ProcessTable::init() to have been called.")
            .processes
            .read()
            .get(&pid)
            .cloned()
    }

    /// Used internally when forking or creating a process to add to process table.
    /// # Panics
    /// Panics if ProcessTable::init() has not been called.
    fn add_process(process: UserProcess) {
        PROCESS_TABLE
            .get()
            .expect("Expected ProcessTable::init() to have been called.")
            .processes
            .write()
            .insert(process.pid, Arc::new(Mutex::new(process)));
    }

    /// Drops a process's table entry once nothing else needs it. Called
    /// after a `wait()` has collected its status.
    pub fn remove(pid: u32) {
        if let Some(table) = PROCESS_TABLE.get() {
            table.processes.write().remove(&pid);
        }
    }
}

pub struct FileDescriptor {
    pub inode: Arc<Inode>,
    pub offset: u64,
    pub flags: u32,
}

/// A single user process (spec.md 3): its address space, open files and
/// the bookkeeping needed for `fork`/`exec`/`wait`/`exit` (spec.md 4.7).
pub struct UserProcess {
    /// Open file descriptors
    pub files: BTreeMap<u32, Arc<RwLock<FileDescriptor>>>, // So that file descriptors can be shared
    next_fd: u32, // TODO: be less naive (if you repeatedly open and close file descriptors you will run out)
    pub mapper: OffsetPageTable<'static>,
    pub thread: Arc<Mutex<Thread>>,
    pub pid: u32,
    pub name: String,
    pub brk: VirtAddr,
    pub brk_initial: VirtAddr,
    pub cr3_frame: PhysFrame,
    /// Whether `cr3_frame` is a root this process owns and must destroy on
    /// exit. `false` for the init process, which reuses the boot page table
    /// directly (destroying it would take the kernel down too); `true` for
    /// every `fork`ed child, whose root came from `pagetable::pml4_create`.
    pub owns_page_table: bool,
    pub spt: SupplementalPageTable,
    pub stack_bottom: VirtAddr,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    pub exit_status: Option<i32>,
    pub load_sema: Semaphore,
    pub wait_sema: Semaphore,
    pub exit_sema: Semaphore,
    /// The inode backing the running executable, kept open for the
    /// lifetime of the process to deny writes to it (spec.md 4.5/4.9).
    pub self_file: Option<Arc<Inode>>,
    /// Active `mmap` regions, `(start address, page count)`.
    pub mmaps: Vec<(VirtAddr, usize)>,
}

impl UserProcess {
    /// Used for creating the initial process.
    /// Reuses the initialisation page tables.
    /// Returns the PID of the new process.
    pub fn create(mapper: OffsetPageTable<'static>) -> u32 {
        let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(Mutex::new(Thread::from_func(
            enter_userspace,
            Some(pid),
            None,
            None,
        )));

        let process = UserProcess {
            files: BTreeMap::new(),
            next_fd: 2, // 0 and 1 are reserved for stdin/stdout (spec.md 6)
            mapper,
            thread: thread.clone(),
            pid,
            name: String::new(),
            brk: VirtAddr::new(0),
            brk_initial: VirtAddr::new(0),
            cr3_frame: Cr3::read().0,
            owns_page_table: false,
            spt: SupplementalPageTable::new(),
            stack_bottom: crate::userstack::USER_STACK,
            parent: None,
            children: Vec::new(),
            exit_status: None,
            load_sema: Semaphore::new(0),
            wait_sema: Semaphore::new(0),
            exit_sema: Semaphore::new(0),
            self_file: None,
            mmaps: Vec::new(),
        };

        thread.lock().cr3_frame = Some(process.cr3_frame);

        let pid = process.pid;
        ProcessTable::add_process(process);
        pid
    }

    /// See the POSIX execve system call for information on how it is used.
    /// Currently this only supports static ELF loading -- dynamic
    /// executables or shebang scripts are not supported. Lazily registers
    /// `PT_LOAD` pages instead of copying them in eagerly (spec.md 4.3,
    /// 4.5); only the stack's first page is materialized up front.
    pub fn execve(
        &mut self,
        binary: &[u8],
        inode: Arc<Inode>,
        args: &[&str],
        _env: &[&str], // TODO: environment variables
    ) -> Result<(), LoadingError> {
        {
            let mut pmm = USER_PMM.get().unwrap().lock();
            self.spt.kill(&mut self.mapper, &mut pmm);
        }

        let image = elf::load(binary, inode.clone(), &mut self.mapper, &mut self.spt)?;
        self.brk_initial = image.brk_initial;
        self.brk = self.brk_initial;
        self.self_file = Some(inode);
        self.name = args.first().map(|s| (*s).to_owned()).unwrap_or_default();

        let (rsp, stack_bottom) = {
            let mut pmm = USER_PMM.get().unwrap().lock();
            crate::userstack::build(&mut self.mapper, &mut pmm, &mut self.spt, args)
                .map_err(|_| LoadingError::Unsupported)?
        };
        self.stack_bottom = stack_bottom;

        let mut thread = self.thread.lock();
        thread.context.rbp = image.entry.as_u64(); // userspace entry point
        thread.context.rbx = rsp.as_u64(); // userspace stack pointer
        thread.context.rdi = args.len() as u64; // argc
        thread.context.rsi = rsp.as_u64() + 8; // argv, right above the fake return slot
        drop(thread);

        debug_println!("execve: entry {:x} rsp {:x}", image.entry.as_u64(), rsp.as_u64());
        Ok(())
    }

    /// Allocates a user accessible page, tracked in the supplemental page
    /// table like every other mapping (used for heap growth via `brk`).
    pub unsafe fn allocate_user_page(&mut self, page: Page, writable: bool) {
        let mut pmm = USER_PMM.get().unwrap().lock();
        let mut descriptor = vm::Page::new_anon(page.start_address(), writable, false);
        descriptor
            .swap_in(&mut self.mapper, &mut pmm)
            .expect("allocate_user_page: frame pool exhausted");
        let _ = self.spt.insert_page(descriptor);
    }

    pub unsafe fn unmap_page(&mut self, page: Page) {
        let mut pmm = USER_PMM.get().unwrap().lock();
        self.spt.remove_page(page.start_address(), &mut self.mapper, &mut pmm);
    }

    /// Duplicates the address space via `vm::spt::copy` (spec.md 4.3/4.7)
    /// and forks the thread. Returns the child PID.
    pub fn fork(&self) -> Result<u32, ()> {
        let mut pmm = USER_PMM.get().unwrap().lock();
        let (frame, mut mapper) = pagetable::pml4_create(self.mapper.phys_offset(), &mut pmm);

        let mut spt = SupplementalPageTable::new();
        vm::spt::copy(&mut spt, &self.spt, &mut mapper, &self.mapper, &mut pmm)?;
        drop(pmm);

        let child_pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        let files = duplicate_files(&self.files);

        let child = UserProcess {
            files,
            next_fd: self.next_fd,
            mapper,
            thread: Arc::new(Mutex::new(Thread::from_func(
                forked_entry,
                Some(child_pid),
                Some("forked".to_owned()),
                Some(frame),
            ))),
            pid: child_pid,
            name: self.name.clone(),
            brk: self.brk,
            brk_initial: self.brk_initial,
            cr3_frame: frame,
            owns_page_table: true,
            spt,
            stack_bottom: self.stack_bottom,
            parent: Some(self.pid),
            children: Vec::new(),
            exit_status: None,
            load_sema: Semaphore::new(0),
            wait_sema: Semaphore::new(0),
            exit_sema: Semaphore::new(0),
            self_file: self.self_file.clone(),
            mmaps: self.mmaps.clone(),
        };

        let pid = child.pid;
        ProcessTable::add_process(child);
        Ok(pid)
    }
}

/// Duplicates a file table for `fork` (spec.md 4.7 step 4): fd 0/1 (console)
/// are shared between parent and child, same as a real `dup`, but every
/// other fd gets its own open handle with an independently seekable cursor,
/// reopened against the same inode with the parent's current offset copied
/// in. Sharing the `Arc<RwLock<FileDescriptor>>` instead would make reads in
/// one process move the other's seek position too.
fn duplicate_files(
    files: &BTreeMap<u32, Arc<RwLock<FileDescriptor>>>,
) -> BTreeMap<u32, Arc<RwLock<FileDescriptor>>> {
    let vfs = crate::VFS.get().unwrap();
    files
        .iter()
        .map(|(&fd, descriptor)| {
            if fd < 2 {
                return (fd, descriptor.clone());
            }
            let parent = descriptor.read();
            let _ = vfs.open(parent.inode.clone());
            let duplicate = Arc::new(RwLock::new(FileDescriptor {
                inode: parent.inode.clone(),
                offset: parent.offset,
                flags: parent.flags,
            }));
            (fd, duplicate)
        })
        .collect()
}

/// Enters userspace, enabling interrupts. Since thread entry points
/// can't take parameters:
/// - rbp stores userspace entry point
/// - rbx stores userspace stack pointer
#[unsafe(naked)]
pub(crate) unsafe extern "sysv64" fn enter_userspace() {
    naked_asm!(
        // We must keep the userspace stack in rbx, since the kstack
        // is used to 'return' into here.
        "mov rsp, rbx
        mov rcx, rbp
        mov r11, 0x0202
        sysretq"
    )
}

/// Forked entry uses the top 6 items on the stack to restore callee-saved parameters to return to userspace
#[unsafe(naked)]
pub(crate) unsafe extern "sysv64" fn forked_entry() {
    naked_asm!(
        "
        pop rbp
        pop r15
        pop r14
        pop r13
        pop r12
        pop rbx

        xor rax, rax // return 0

        jmp {}
        ", sym syscall_ret
    )
}
