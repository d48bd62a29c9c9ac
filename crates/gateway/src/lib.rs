//! Huddle gateway: browser-facing multiplayer streaming core.
//!
//! Fans one encoded video/audio feed out to up to four players plus
//! spectators over WebRTC, demultiplexes their input into a shared
//! virtual-input surface, and arbitrates device ownership per room.

pub mod fanout;
pub mod input_router;
pub mod peer;
pub mod registry;
pub mod room;
pub mod rtp;
pub mod sender;
pub mod service;
pub mod signaling;
pub mod sink;
pub mod stats;
pub mod transport;

pub use service::Gateway;
pub use signaling::SignalingAdapter;
