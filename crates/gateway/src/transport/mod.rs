//! Boundary to the ICE/DTLS/SRTP transport library.
//!
//! The session core talks to peers exclusively through `PeerTransport`,
//! so rooms, routing, and fan-out are testable without a network. The
//! one concrete implementation wraps webrtc-rs (`webrtc.rs`).

pub mod webrtc;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::fanout::PacketKind;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Connection-level events surfaced to the peer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// ICE connectivity checks in progress.
    IceChecking,
    /// DTLS handshake complete.
    Connected,
    /// Transient failure; reconnection may recover it.
    Disconnected,
    Failed,
    Closed,
    /// The reliable input channel opened.
    InputChannelOpen,
    InputChannelClosed,
}

pub type TransportEventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;
pub type InputDataHandler = Arc<dyn Fn(Bytes) + Send + Sync>;
pub type CandidateHandler = Arc<dyn Fn(String, Option<String>, Option<u16>) + Send + Sync>;
pub type KeyframeRequestHandler = Arc<dyn Fn() + Send + Sync>;

/// One peer's transport: media out, reliable channel both ways, and
/// the signaling glue (offer/answer, trickle ICE).
pub trait PeerTransport: Send + Sync {
    /// Queue one RTP packet (video or audio) for delivery.
    fn send_media(&self, kind: PacketKind, packet: Bytes) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Send bytes on the reliable input channel (gateway -> browser).
    fn send_control(&self, data: Bytes) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Apply a remote SDP offer and produce the local answer.
    fn handle_offer(&self, sdp: String) -> BoxFuture<'_, anyhow::Result<String>>;

    /// Add a remote ICE candidate.
    fn add_remote_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> BoxFuture<'_, anyhow::Result<()>>;

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Register the connection-event handler. One handler per
    /// transport; later calls replace it.
    fn on_event(&self, handler: TransportEventHandler);

    /// Register the inbound reliable-channel handler.
    fn on_input(&self, handler: InputDataHandler);

    /// Register the local trickle-ICE candidate handler.
    fn on_local_candidate(&self, handler: CandidateHandler);

    /// Register the handler fired when the remote requests a keyframe
    /// (PLI/FIR).
    fn on_keyframe_request(&self, handler: KeyframeRequestHandler);
}
