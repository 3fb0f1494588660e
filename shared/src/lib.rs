pub mod config;
pub mod logging;
pub mod protocol;

pub use config::*;
pub use protocol::*;
