pub mod config;
pub mod input;
pub mod signaling;

pub use config::*;
pub use input::*;
pub use signaling::*;
