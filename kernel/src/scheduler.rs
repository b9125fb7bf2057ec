use core::{
    mem::offset_of,
    sync::atomic::{AtomicU32, Ordering},
};

use alloc::{
    borrow::ToOwned,
    collections::vec_deque::VecDeque,
    string::String,
    sync::Arc,
    vec,
    vec::Vec,
};
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::{
    registers::control::Cr3,
    structures::paging::PhysFrame,
    VirtAddr,
};

use crate::{CPUS, debug_print, debug_println};

static READY: OnceCell<Mutex<VecDeque<Arc<Mutex<Thread>>>>> = OnceCell::uninit();
static NEXT_TID: AtomicU32 = AtomicU32::new(0);

/// Used Redox for reference.
/// https://gitlab.redox-os.org/redox-os/kernel/-/blob/master/src/context/arch/x86_64.rs?ref_type=heads
///
/// These are all System V ABI callee-saved registers, the rest will be pushed
/// to stack on function call
#[derive(Default, Clone, Debug)]
#[repr(C)]
pub struct Context {
    pub rflags: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    /// Not callee-saved by the System V ABI, but carried across a switch
    /// anyway: `execve` stashes argc/the argv pointer here so `enter_userspace`
    /// can load them straight into `rdi`/`rsi` right before `sysretq`
    /// (spec.md 4.6 step 6).
    pub rdi: u64,
    pub rsi: u64,
}

impl Context {
    /// Creates a blank context, values will be saved on switch
    pub fn new() -> Self {
        Context::default()
    }
}

pub struct Thread {
    pub context: Context,
    /// Kernel stack
    pub kstack: Vec<u64>,
    /// Owning process, by pid. Looked up through `ProcessTable` rather than
    /// held as an `Arc`/`Weak` to avoid a reference cycle between a process
    /// and its own thread.
    pub process: Option<u32>,
    /// Root page table frame to activate whenever this thread is scheduled.
    /// `None` means "run under the kernel's base page table".
    pub cr3_frame: Option<PhysFrame>,
    /// Thread id
    pub tid: u32,
    pub name: Option<String>,
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name.clone().unwrap_or("<no name>".to_owned()))
            .field("context", &format_args!("{:x?}", self.context))
            .field("process", &self.process)
            .finish()
    }
}

impl Thread {
    pub fn from_func(
        func: unsafe extern "sysv64" fn(),
        process: Option<u32>,
        name: Option<String>,
        cr3_frame: Option<PhysFrame>,
    ) -> Thread {
        let mut thread = Thread {
            context: Context::new(),
            kstack: vec![0; 2 * 4096],
            process,
            cr3_frame,
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name,
        };

        thread.set_func(func);
        thread
    }

    /// Points this thread's entry at `func`, as if freshly created, without
    /// disturbing its identity (tid) or allocated kernel stack. Used by
    /// `execve` to repoint a thread at `enter_userspace` after the address
    /// space underneath it has just been replaced.
    pub fn set_func(&mut self, func: unsafe extern "sysv64" fn()) {
        *self.kstack.last_mut().unwrap() = func as u64;
        self.context = Context::new();
        self.context.rsp = self.kstack.last_mut().unwrap() as *const u64 as u64;
    }

    /// Virtual address of the top of this thread's kernel stack, used as
    /// the privilege-level-0 stack loaded into the TSS on syscall entry.
    pub fn kstack_addr(&self) -> VirtAddr {
        VirtAddr::new(self.kstack.as_ptr() as u64 + (self.kstack.len() * size_of::<u64>()) as u64)
    }
}

pub fn init() {
    READY
        .try_init_once(|| Mutex::new(VecDeque::new()))
        .expect("scheduler::init should only be called once.")
}

pub fn enqueue(thread: Arc<Mutex<Thread>>) {
    READY
        .get()
        .expect("scheduler::init should have been called")
        .lock()
        .push_back(thread);
}

/// Returns the thread currently executing on this CPU, if any.
pub fn current_thread() -> Option<Arc<Mutex<Thread>>> {
    CPUS.get().unwrap().get_cpu().current_thread.clone()
}

/// Taken from redox os, with some modifications
#[unsafe(naked)]
unsafe extern "sysv64" fn switch_to(_prev: &mut Context, _next: &Context) {
    // prev = rdi, next = rsi
    // The next context is a read-only clone, to save us from having to deal with its lock
    core::arch::naked_asm!(
        concat!("
            // Save old registers, and load new ones
            mov [rdi + {off_rbx}], rbx
            mov rbx, [rsi + {off_rbx}]

            mov [rdi + {off_r12}], r12
            mov r12, [rsi + {off_r12}]

            mov [rdi + {off_r13}], r13
            mov r13, [rsi + {off_r13}]

            mov [rdi + {off_r14}], r14
            mov r14, [rsi + {off_r14}]

            mov [rdi + {off_r15}], r15
            mov r15, [rsi + {off_r15}]

            mov [rdi + {off_rbp}], rbp
            mov rbp, [rsi + {off_rbp}]

            mov [rdi + {off_rsp}], rsp
            mov rsp, [rsi + {off_rsp}]

            // push RFLAGS (can only be modified via stack)
            pushfq
            // pop RFLAGS into `self.rflags`
            pop QWORD PTR [rdi + {off_rflags}]

            // push `next.rflags`
            push QWORD PTR [rsi + {off_rflags}]
            // pop into RFLAGS
            popfq

            // rdi/rsi aren't callee-saved, so there is nothing meaningful of
            // the caller's to preserve into `prev`; load `next`'s values
            // last, since everything above still needed `rdi`/`rsi` as the
            // prev/next Context pointers.
            mov r8, [rsi + {off_rdi}]
            mov r9, [rsi + {off_rsi}]
            mov rdi, r8
            mov rsi, r9

            // When we return, we cannot even guarantee that the return address on the stack, points to
            // the calling function, `context::switch`. Thus, we have to execute this Rust hook by
            // ourselves, which will unlock the contexts before the later switch.

            // Note that switch_finish_hook will be responsible for executing `ret`.
            jmp {switch_hook}
            "),

        off_rflags = const(offset_of!(Context, rflags)),

        off_rbx = const(offset_of!(Context, rbx)),
        off_r12 = const(offset_of!(Context, r12)),
        off_r13 = const(offset_of!(Context, r13)),
        off_r14 = const(offset_of!(Context, r14)),
        off_r15 = const(offset_of!(Context, r15)),
        off_rbp = const(offset_of!(Context, rbp)),
        off_rsp = const(offset_of!(Context, rsp)),
        off_rdi = const(offset_of!(Context, rdi)),
        off_rsi = const(offset_of!(Context, rsi)),

        switch_hook = sym switch_finish_hook,
    );
}

/// Releases locks, sets current thread, and activates its address space.
///
/// The page-table activation is the scheduler's half of spec.md 4.1's
/// `pml4_activate`: each thread carries the root frame of the address space
/// it should run under, and we load CR3 here rather than at every syscall
/// or fault entry.
unsafe extern "sysv64" fn switch_finish_hook() {
    let cpu = CPUS.get().unwrap().get_cpu();
    if let Some(thread) = cpu.current_thread.as_mut() {
        thread.force_unlock();
    }

    cpu.current_thread = cpu.next_thread.clone();
    cpu.next_thread = None;

    let next = cpu.current_thread.clone().unwrap();
    let next = next.lock();

    cpu.set_ist(VirtAddr::new(next.context.rsp));

    if let Some(frame) = next.cr3_frame {
        let (current_frame, flags) = Cr3::read();
        if current_frame != frame {
            unsafe { Cr3::write(frame, flags) };
        }
    }
}

/// Retires the calling thread for good (spec.md 4.7 exit step). Unlike
/// `yield_execution`, nothing ever re-enqueues this thread, so once the
/// switch away happens control never returns here; the `Thread`/`kstack` are
/// dropped once the process table's `Arc` reference to it goes too (see
/// `ProcessTable::remove`, driven by a parent's `wait`).
pub fn exit_current_thread() -> ! {
    loop {
        yield_execution();
    }
}

/// Yields to scheduler, but keep current thread in queue.
pub fn yield_and_continue() {
    if let Some(thread) = CPUS.get().unwrap().get_cpu().current_thread.as_ref() {
        enqueue(thread.clone());
    }
    yield_execution();
}

/// Yields to scheduler to decide what should use CPU time, without
/// requeuing the current thread. This is the primitive `sync::Semaphore`
/// blocks on: a thread that calls this and is never re-enqueued stays
/// asleep until something else calls `enqueue` on it.
pub fn yield_execution() {
    x86_64::instructions::interrupts::disable();

    let cpu = CPUS.get().unwrap().get_cpu();
    let next_thread = {
        READY
            .get()
            .expect("scheduler::init should have been called")
            .lock()
            .pop_front()
    }
    .unwrap_or(cpu.idle_thread.clone());

    let current_thread = cpu.current_thread.as_mut();

    let prev: &mut Context = match current_thread {
        None => &mut Context::new(), // Dummy context
        Some(thread) => {
            // If the next thread and the current thread is the same, we will deadlock
            if Arc::ptr_eq(&thread.clone(), &next_thread) {
                debug_print!(".");
                return;
            }
            debug_println!("Switching from {:?} to {:?}", thread, next_thread);
            &mut thread.lock().context
        }
    };

    let next = { next_thread.lock().context.clone() }; // The lock will be released after this

    CPUS.get().unwrap().get_cpu().next_thread = Some(next_thread.clone());

    unsafe {
        switch_to(prev, &next);
    }
}
