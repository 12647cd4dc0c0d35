//! Public facade crate for `exagate`.
//!
//! This crate intentionally contains no IO or provider-specific logic.
//! It re-exports the backend-agnostic types/traits from `exagate-core`.

pub use exagate_core::*;
