//! CLI command implementations.

pub mod inspect;
pub mod menu;
pub mod reap;
pub mod simulate;
