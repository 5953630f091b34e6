//! Ban tracking and release workflow.

mod registry;

pub use registry::{BanEntry, BanInsert, BanRegistry, BanStore, MemoryBanStore};
