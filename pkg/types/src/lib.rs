//! Shared data types for mesh-ca: configuration file schema, identities,
//! secret objects and small parsing/validation helpers.

pub mod config;
pub mod duration;
pub mod identity;
pub mod secret;
pub mod validate;
