//! Duplicate-group resolution and merge-orchestration engine.
//!
//! This module exports the core components for testing and integration.

pub mod backend;
pub mod cli;
pub mod clock;
pub mod config;
pub mod db;
pub mod drafts;
pub mod error;
pub mod executor;
pub mod logging;
pub mod master;
pub mod orchestrator;
pub mod preview;
pub mod resolver;
pub mod store;
pub mod types;
