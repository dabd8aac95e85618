//! Core types, wire protocol, errors, and config for voxrelay.

pub mod config;
pub mod error;
pub mod protocol;
