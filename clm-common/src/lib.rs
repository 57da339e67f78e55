//! # CLM Common Library
//!
//! Shared code for the Corner League Media maintenance tools including:
//! - Database connection handling and the base schema
//! - Ordered migration runner
//! - Schema introspection, drift detection and table rebuilds
//! - Typed row models
//! - Health-check result types shared by validators and repair tools
//! - Snapshot/restore and the migration log
//! - Configuration loading

pub mod config;
pub mod db;
pub mod error;
pub mod health;

pub use error::{Error, Result};
pub use health::{CheckResult, CheckStatus, HealthReport};
