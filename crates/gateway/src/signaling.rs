//! Signaling adapter: the thin boundary between the HTTPS signaling
//! host and the per-peer state machines.
//!
//! Inbound envelopes are demultiplexed by `(room, peer)`; outbound
//! answers and trickle-ICE candidates go back through the channel the
//! host provided. No business logic lives here.

use std::sync::Arc;

use anyhow::Context;
use huddle_protocol::{
    CandidatePayload, JoinPayload, SdpPayload, SignalEnvelope, SignalKind,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::service::Gateway;

pub struct SignalingAdapter {
    gateway: Arc<Gateway>,
    outbound: mpsc::Sender<SignalEnvelope>,
}

impl SignalingAdapter {
    pub fn new(gateway: Arc<Gateway>, outbound: mpsc::Sender<SignalEnvelope>) -> Self {
        gateway.set_signal_sender(outbound.clone());
        Self { gateway, outbound }
    }

    /// Route one envelope from the signaling host.
    pub async fn handle_inbound(&self, envelope: SignalEnvelope) -> anyhow::Result<()> {
        match envelope.kind {
            SignalKind::Join => {
                let join: JoinPayload = envelope
                    .decode_payload()
                    .context("Malformed join payload")?;
                self.gateway
                    .admit(&envelope.room, envelope.peer, &join)
                    .await
            }
            SignalKind::Offer => {
                let offer: SdpPayload = envelope
                    .decode_payload()
                    .context("Malformed offer payload")?;
                let answer = self.gateway.handle_offer(envelope.peer, offer.sdp).await?;
                self.outbound
                    .send(SignalEnvelope::new(
                        SignalKind::Answer,
                        &envelope.room,
                        envelope.peer,
                        SdpPayload { sdp: answer },
                    ))
                    .await
                    .context("Outbound signal channel closed")?;
                Ok(())
            }
            SignalKind::Candidate => {
                let candidate: CandidatePayload = envelope
                    .decode_payload()
                    .context("Malformed candidate payload")?;
                self.gateway
                    .add_ice_candidate(
                        envelope.peer,
                        candidate.candidate,
                        candidate.sdp_mid,
                        candidate.sdp_mline_index,
                    )
                    .await
            }
            SignalKind::Leave => {
                self.gateway.close_peer(envelope.peer);
                Ok(())
            }
            SignalKind::Answer => {
                // The gateway is always the answerer; an inbound answer
                // is a confused client, not an error worth surfacing.
                debug!(peer = %envelope.peer, "Ignoring unexpected answer envelope");
                Ok(())
            }
        }
    }
}
