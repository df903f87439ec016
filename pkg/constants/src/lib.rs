//! Centralized constants for the mesh-ca project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod controller;
pub mod network;
pub mod paths;
pub mod pki;
pub mod secret;
