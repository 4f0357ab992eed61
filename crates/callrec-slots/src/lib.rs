//! # callrec-slots
//!
//! The per-tenant admission protocol of the acquisition engine: a bounded
//! slot table plus a FIFO wait queue, with liveness markers so that slots
//! held by crashed workers are reclaimed automatically.
//!
//! Two backends implement the same [`SlotAllocator`] protocol:
//!
//! - [`redis::RedisSlotAllocator`] — Lua-script based, atomic across
//!   processes, the authority in multi-node deployments;
//! - [`memory::MemorySlotAllocator`] — mutex-guarded in-process state for
//!   single-node deployments and tests.

pub mod allocator;
pub mod memory;
#[cfg(feature = "redis-slots")]
pub mod redis;
pub mod sweeper;

pub use allocator::{AcquireOutcome, QueueSnapshot, SlotAllocator, SlotAllocatorDispatch};
