//! Stream supervision
//!
//! This module owns every live subscription:
//! - `registry`: the mutex-guarded key → connection map
//! - `rate_limiter`: per-second cap on upstream opens
//! - `orchestrator`: the open / close protocol and batch opens
//! - `handler`: callback adapter wired into each subscription
//! - `auditor`: periodic, read-only health and status passes
//!
//! Everything here runs on the scheduler thread.

pub mod auditor;
pub mod handler;
pub mod orchestrator;
pub mod rate_limiter;
pub mod registry;
