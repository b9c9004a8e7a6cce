// Warn on unused dependencies to catch platform-specific cfg mismatches
#![warn(unused_crate_dependencies)]
// Warn on redundant path prefixes (e.g., std::path::Path when Path is imported)
#![warn(unused_qualifications)]
// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Volume catalog: scans drives and folders into per-volume SQLite stores,
//! keeps a full-text name index, and re-syncs volumes through a shadow store
//! so the previously cataloged data is never at risk.

pub mod config;
mod ignore_poison;
pub mod indexing;

pub use config::{CatalogConfig, load_config};
pub use indexing::{CatalogError, CatalogService};
