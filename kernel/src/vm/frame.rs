//! Frame table (spec.md 2, 4.2): a reverse map from physical frame to the
//! virtual address of the descriptor currently backing it, used to find an
//! eviction candidate when the user pool is exhausted.
//!
//! No eviction policy is implemented: spec.md's Non-goals exclude swap to
//! disk, and `original_source/vm/file.c` itself stubs out
//! `file_backed_swap_in`/`swap_out`. `evict` always fails, the same way the
//! reference's own swap path never actually runs.

use alloc::collections::btree_map::BTreeMap;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

pub static FRAME_TABLE: OnceCell<Mutex<FrameTable>> = OnceCell::uninit();

pub struct FrameTable {
    owners: BTreeMap<PhysFrame, (u32, VirtAddr)>,
}

impl FrameTable {
    pub fn init() {
        FRAME_TABLE.init_once(|| {
            Mutex::new(FrameTable {
                owners: BTreeMap::new(),
            })
        });
    }

    pub fn record(&mut self, frame: PhysFrame, pid: u32, va: VirtAddr) {
        self.owners.insert(frame, (pid, va));
    }

    pub fn release(&mut self, frame: PhysFrame) {
        self.owners.remove(&frame);
    }

    pub fn owner(&self, frame: PhysFrame) -> Option<(u32, VirtAddr)> {
        self.owners.get(&frame).copied()
    }

    /// Picks an eviction candidate and reclaims its frame. Always `None`
    /// in this build (see module docs).
    pub fn evict(&mut self) -> Option<PhysFrame> {
        None
    }
}
