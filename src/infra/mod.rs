//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod frames;
pub mod git;
pub mod http;
pub mod marimo;
pub mod proxy;
pub mod sessions;
pub mod telemetry;
pub mod upstream;
