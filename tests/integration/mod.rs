//! Integration tests for querygate.

pub mod common;
pub mod drainer_test;
pub mod persistence_test;
pub mod pipeline_test;
