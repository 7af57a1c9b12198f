//! Infrastructure layer
//!
//! Handles all I/O operations: network, filesystem, and external processes.
//! This module is the only place where side effects occur.

pub mod dirs;
pub mod download;
pub mod filesystem;
pub mod invoke;
pub mod pm;
pub mod shell;
pub mod vcs;
