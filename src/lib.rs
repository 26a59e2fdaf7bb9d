pub mod audit;
pub mod bootstrap;
pub mod changelog;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod notify;
pub mod projection;
pub mod status;

pub use error::SentinelError;
