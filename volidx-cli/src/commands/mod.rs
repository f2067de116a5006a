//! Mode implementations.

pub mod index;
pub mod sample;
pub mod search;
