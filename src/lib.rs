//! genjob: async generation jobs for slow AI calls.
//!
//! The server side ([`jobs::JobService`]) stores jobs, runs one worker per
//! job against a [`provider::GenerationProvider`] and exposes them over HTTP
//! ([`api`]). The client side ([`client`]) keeps a durable handle, polls it,
//! and drops it when the server restarted.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod jobs;
pub mod provider;
pub mod store;
