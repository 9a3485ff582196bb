//! Repository layer over the persistence context.
//!
//! # Responsibility
//! - Provide one generic data-access surface for every entity type.
//! - Keep state-transition rules out of callers and out of the context.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`NotFound`, `DuplicateKey`) in
//!   addition to DB transport errors.

pub mod repository;

pub use repository::{Query, Repository};
