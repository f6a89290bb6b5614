#![deny(unused)]
//! Core types, errors, and configuration for the Minibox SDK.
//!
//! This crate provides the building blocks shared by every part of the
//! client: the error taxonomy, the wire protocol frames exchanged with the
//! sandbox service, client configuration, and the filesystem path policy.

pub mod config;
pub mod error;
pub mod fs_policy;
pub mod protocol;

pub use config::ClientConfig;
pub use error::{Error, Result, TransportError};
