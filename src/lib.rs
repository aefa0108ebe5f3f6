#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connections;
pub mod content;
pub mod dashboard;
pub mod error;
pub mod models;
pub mod oauth;
pub mod session;
pub mod storage;
pub mod subscription;
pub mod upload;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, App};
