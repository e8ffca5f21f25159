//! Common Types and Utilities
//!
//! Shared types and small DSP helpers used across the cell-search workspace.

pub mod types;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use utils::*;
