pub mod config;
pub mod messages;
pub mod wire;

pub use config::*;
pub use messages::*;
pub use wire::*;
