//! Core build logic
//!
//! Recipe parsing, dependency resolution and build orchestration. Side
//! effects go through [`crate::infra`] or through the collaborator traits
//! ([`pm::PackageManager`], [`fetch::SourceProvider`],
//! [`builder::BuildInvoker`]).
//!
//! # Submodules
//!
//! - [`bashvar`] - Restricted shell-assignment language
//! - [`package`] - Package and source descriptors
//! - [`parser`] - Recipe parsing
//! - [`find`] - Recipe lookup in a tree
//! - [`pm`] - Package manager gate
//! - [`resolver`] - Dependency resolution
//! - [`fetch`] - Source fetching and processing
//! - [`autobuild`] - Stage 2 detection and checksum generation
//! - [`builder`] - Build orchestration
//! - [`checkpoint`] - Build checkpoints
//! - [`resume`] - Resuming from a checkpoint
//! - [`forest`] - Tree registry

pub mod autobuild;
pub mod bashvar;
pub mod builder;
pub mod checkpoint;
pub mod fetch;
pub mod find;
pub mod forest;
pub mod package;
pub mod parser;
pub mod pm;
pub mod resolver;
pub mod resume;
