//! Core domain + application logic for the Telegram <-> AI relay.
//!
//! This crate is framework-agnostic. The Telegram Bot API and the completion
//! backend live behind ports (traits) implemented in adapter crates.

pub mod command;
pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod ports;
pub mod relay;
pub mod session;

pub use errors::{Error, Result};
