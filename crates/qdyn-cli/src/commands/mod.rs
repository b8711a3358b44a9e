//! CLI command implementations.

pub mod problem_file;
pub mod solve;
pub mod version;
