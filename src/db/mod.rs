//! Database module: view models and SQL repositories.
//!
//! - `model`: view structs returned by repositories that are not domain types.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `ig_repostbot::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::RunRecord;
