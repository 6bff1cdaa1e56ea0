//! Centralized constants for the ember project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod paths;
pub mod runtime;
pub mod workload;
