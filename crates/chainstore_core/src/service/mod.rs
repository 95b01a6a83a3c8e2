//! Entity lifecycle services.
//!
//! # Responsibility
//! - Version chains: head resolution, snapshots, head promotion, purge.
//! - Publication exclusivity within a chain.
//! - Cache dependency declarations and invalidation propagation.
//!
//! # Invariants
//! - After any successful top-level `persist`, a chain has at most one
//!   published revision.
//! - Chain pointer mismatches surface as `EngineError::InconsistentChain`
//!   and are never repaired silently.

pub mod chain;
pub mod dependency_graph;
pub mod error;
pub mod invalidation;
pub mod publication_guard;
pub mod versioning_service;
