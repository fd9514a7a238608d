//! Application services: discovery, precompute, config patching and access rules.

pub mod auth;
pub mod backend;
pub mod discovery;
pub mod error;
pub mod mount;
pub mod precompute;
pub mod readiness;
pub mod resolve;
pub mod seeding;
