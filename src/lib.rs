//! forestbuild - package build orchestrator for recipe trees
//!
//! Finds package recipes in a source tree, orders them by their
//! dependencies, and drives the external build tool for each one, with
//! checkpoints to resume an interrupted build.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Recipes, dependency resolution and build orchestration
//! - [`infra`] - Infrastructure layer (network, filesystem, processes)
//! - [`config`] - Configuration and constants
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;

#[cfg(test)]
pub mod test_utils;
