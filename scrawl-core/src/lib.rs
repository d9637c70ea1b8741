pub mod bootstrap;
pub mod config;
pub mod directory;
pub mod error;
pub mod logging;
pub mod models;

pub use config::Config;
pub use directory::{MemoryDirectory, RedisDirectory, SessionDirectory};
pub use error::{Error, Result};
