pub mod app;
pub mod browser;
pub mod config;
pub mod controller;
pub mod correlation;
pub mod error;
pub mod harness;
pub mod model;
pub mod plugin;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod session;
