//! Persistence contract, SQLite store and lifecycle hooks.
//!
//! # Responsibility
//! - Define the abstract store contract the lifecycle services consume.
//! - Keep SQL details inside the store boundary.
//! - Map typed entities to and from untyped rows.
//!
//! # Invariants
//! - Every write joins one open transaction; only `commit()` makes it durable.
//! - Repository APIs return semantic errors (`NotFound`, `Contract`) in
//!   addition to DB transport errors.

pub mod lifecycle;
pub mod mapping;
pub mod record;
pub mod store;
