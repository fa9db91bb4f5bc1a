//! Buffer manager for MartenDB.
//!
//! A fixed pool of page frames with pin counting, dirty tracking and clock
//! replacement. Clients acquire a page with [`BufferManager::read_page`] or
//! [`BufferManager::alloc_page`] (both pin), access its bytes through the
//! scoped [`BufferManager::with_page`] / [`BufferManager::with_page_mut`]
//! accessors, and release it with [`BufferManager::unpin_page`], passing
//! `dirty = true` exactly when the bytes changed. A pinned page is never
//! evicted; evicting a dirty unpinned page writes it back to its file
//! first.

pub mod frame;
pub mod manager;
pub mod replacer;

pub use frame::{Frame, FrameId};
pub use manager::{BufferConfig, BufferManager, BufferStats, PageStore};
pub use replacer::ClockReplacer;
