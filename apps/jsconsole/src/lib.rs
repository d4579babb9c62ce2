pub mod config;
pub mod console;
pub mod engine;
pub mod logging;
pub mod registry;
pub mod session;
