//! Bookkeeping of grid productions: submission of one task per dataset,
//! monitoring of the tasks, registration of their outputs as samples in the
//! database, merging of extension samples and cleanup of old productions.

pub mod cleanup;
pub mod cli;
pub mod config;
pub mod database;
pub mod datasets;
pub mod error;
pub mod grid;
pub mod harvest;
pub mod importer;
pub mod lumi;
pub mod merge;
pub mod monitor;
pub mod progress;
pub mod provenance;
pub mod services;
pub mod submit;
pub mod task;
pub mod util;

pub use error::RunnerError;
