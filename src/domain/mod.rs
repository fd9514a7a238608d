//! Domain layer types and invariants.

pub mod cells;
pub mod document;
pub mod glob;
pub mod ignore;
