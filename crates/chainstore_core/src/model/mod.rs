//! Entity model shared by the store and the lifecycle services.
//!
//! # Responsibility
//! - Define the metadata every persisted entity carries (identity, chain
//!   pointers, stage, timestamps, instance-level dependencies).
//! - Declare fillable fields as explicit descriptors instead of runtime
//!   reflection.
//!
//! # Invariants
//! - Ids are assigned by the store on first persist and never change.
//! - A head revision has no `head_id`; a revision never points at itself.

pub mod clock;
pub mod dependency;
pub mod entity;
pub mod field;
