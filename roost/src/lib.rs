pub(crate) mod auth;
pub(crate) mod config;
pub(crate) mod context;
pub(crate) mod engine;
pub(crate) mod id;
pub(crate) mod image;
pub(crate) mod message;
pub(crate) mod progress;
pub(crate) mod session;
pub(crate) mod task;
pub(crate) mod trace;
pub(crate) mod version;

pub mod cli;

mod error;

pub(crate) use error::*;

pub(crate) type Result<T, E = Box<dyn std::error::Error + Send + Sync + 'static>> =
    std::result::Result<T, E>;
