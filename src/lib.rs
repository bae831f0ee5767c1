pub mod config;
pub mod control;
pub mod downstream;
pub mod errors;
pub mod hash;
pub mod health;
pub mod line_framer;
pub mod server;
pub mod telemetry;
pub mod worker;

pub use config::Config;
pub use downstream::{AliveFlag, Downstream};
pub use errors::ConfigError;
pub use server::{Command, Server};
