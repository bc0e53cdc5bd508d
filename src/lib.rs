//! querygate - safety-gated natural-language SQL execution.
//!
//! This library exposes the pipeline, its collaborators and the job drainer
//! for the binary and for integration tests.

pub mod config;
pub mod db;
pub mod error;
pub mod language;
pub mod llm;
pub mod persistence;
pub mod pipeline;
pub mod safety;
pub mod worker;
