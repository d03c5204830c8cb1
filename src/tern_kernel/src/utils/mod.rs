//! Utilities
pub(crate) mod arena;
pub(crate) mod atomic;
