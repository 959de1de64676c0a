//! Command-line argument definitions, one module per binary.

pub mod coordinator;
pub mod sequential;
pub mod worker;
