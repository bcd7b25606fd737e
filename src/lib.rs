pub mod bridge;
pub mod config;
pub mod error;
pub mod keyboard;
pub mod link;
pub mod messages;
pub mod motor;
pub mod recorder;
pub mod runtime;
pub mod safety;

pub use error::{Error, Result};
