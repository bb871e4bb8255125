//! Chat sync consumer - Library exports for testing
//!
//! (c) Softlandia 2025

pub mod core;
pub mod infrastructure;
