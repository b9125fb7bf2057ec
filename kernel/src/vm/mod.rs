//! Virtual memory subsystem (spec.md 4.2-4.4, 4.9): supplemental page
//! tables, the frame table, page-fault policy and memory-mapped files.

pub mod fault;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod spt;

pub use page::{FileBacking, Page, PageKind, UninitTarget};
pub use spt::SupplementalPageTable;
