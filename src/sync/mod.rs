//! Sync engine and job dispatch.

pub mod engine;
pub mod jobs;
