//! Hierarchical IP address space allocation for POP provisioning.
//!
//! Containers are carved into role networks, role networks into per-rack
//! subnets and finally single host addresses. Pool state lives behind a
//! [`BlockStore`]: SQLite through [`Store`] or in process via [`MemoryStore`].

pub mod allocator;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod utils;

pub use allocator::{AddressSpaceAllocator, AllocatorOptions};
pub use db::{BlockStore, MemoryStore, PoolChanges, Store};
pub use error::{AllocError, Result};
pub use jobs::{PopAllocation, PopPlan, PopProvisioner};
