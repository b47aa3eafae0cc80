//! Client side of the job protocol.
//!
//! A [`ClientJobHandle`] keeps a job reference in [`HandleStorage`] so it
//! survives reloads, polls the server through a [`JobApi`], and runs the
//! [`RestartGuard`] before reattaching.

pub mod api;
pub mod handle;
pub mod restart_guard;
pub mod storage;

pub use api::{HttpJobApi, JobApi};
pub use handle::{ClientJobHandle, JobOutcome, Resumed};
pub use restart_guard::{DiscardReason, GuardDecision, RestartGuard};
pub use storage::{FileStorage, HandleStorage, MemoryStorage, PersistedHandle};
