//! Per-peer connection state machine.
//!
//! ```text
//! Signaling -> IceGathering -> Connecting -> Connected -> Streaming -> Closed
//!                                   \______________________/
//!                                      Reconnecting (30 s window)
//! ```
//!
//! The machine is pure: events go in, effects come out. The gateway
//! service applies effects (fan-out registration, gamepad release,
//! transport teardown), which keeps every transition unit-testable
//! without a network.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

pub const RECONNECT_WINDOW: Duration = Duration::from_secs(30);
pub const ICE_GATHERING_DEADLINE: Duration = Duration::from_secs(10);
pub const DTLS_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Signaling,
    IceGathering,
    Connecting,
    Connected,
    Streaming,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Local offer/answer assembled; ICE gathering begins.
    LocalDescriptionReady,
    /// The transport reports ICE connectivity checks in progress.
    IceChecking,
    /// DTLS handshake complete.
    DtlsEstablished,
    /// The reliable input channel opened.
    InputChannelOpen,
    /// The reliable input channel closed.
    InputChannelClosed,
    /// The room admitted this peer.
    Admitted,
    /// Transient transport failure; reconnection window opens.
    TransportFailed,
    /// A replacement transport was installed via `update_peer`.
    TransportReplaced,
    /// The transport closed for good, or the peer was removed.
    TransportClosed,
}

/// Side effects the service must apply after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEffect {
    /// Register with the fan-out and subscribe to keyframes.
    RegisterFanout,
    UnregisterFanout,
    /// Ask the encoder for an IDR so this peer's decoder can start.
    RequestKeyframe,
    /// Release all gamepad claims held by this peer.
    ReleaseGamepads,
    /// Tear down the transport handle.
    CloseTransport,
}

/// Deadlines for the timed states, taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct PeerDeadlines {
    pub ice_gathering: Duration,
    pub dtls: Duration,
    pub reconnect: Duration,
}

impl Default for PeerDeadlines {
    fn default() -> Self {
        Self {
            ice_gathering: ICE_GATHERING_DEADLINE,
            dtls: DTLS_DEADLINE,
            reconnect: RECONNECT_WINDOW,
        }
    }
}

pub struct PeerMachine {
    peer_id: Uuid,
    state: PeerState,
    state_since: Instant,
    input_channel_open: bool,
    admitted: bool,
    deadlines: PeerDeadlines,
}

impl PeerMachine {
    pub fn new(peer_id: Uuid, deadlines: PeerDeadlines) -> Self {
        Self {
            peer_id,
            state: PeerState::Signaling,
            state_since: Instant::now(),
            input_channel_open: false,
            admitted: false,
            deadlines,
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == PeerState::Streaming
    }

    pub fn is_closed(&self) -> bool {
        self.state == PeerState::Closed
    }

    fn enter(&mut self, state: PeerState) {
        debug!(peer_id = %self.peer_id, from = ?self.state, to = ?state, "Peer transition");
        self.state = state;
        self.state_since = Instant::now();
    }

    /// Apply one event, returning the effects to execute.
    pub fn on_event(&mut self, event: PeerEvent) -> Vec<PeerEffect> {
        use PeerEvent::*;
        use PeerState::*;

        if self.state == Closed {
            // Terminal; late transport callbacks are expected noise.
            return Vec::new();
        }

        match event {
            LocalDescriptionReady => {
                if self.state == Signaling {
                    self.enter(IceGathering);
                }
                Vec::new()
            }
            IceChecking => {
                if self.state == IceGathering {
                    self.enter(Connecting);
                }
                Vec::new()
            }
            DtlsEstablished => {
                if matches!(self.state, Connecting | IceGathering | Reconnecting) {
                    self.enter(Connected);
                    return self.maybe_stream();
                }
                Vec::new()
            }
            InputChannelOpen => {
                self.input_channel_open = true;
                if self.state == Connected {
                    return self.maybe_stream();
                }
                Vec::new()
            }
            InputChannelClosed => {
                self.input_channel_open = false;
                if self.state == Streaming {
                    self.enter(Connected);
                    return vec![PeerEffect::UnregisterFanout];
                }
                Vec::new()
            }
            Admitted => {
                self.admitted = true;
                if self.state == Connected {
                    return self.maybe_stream();
                }
                Vec::new()
            }
            TransportFailed => {
                let was_streaming = self.state == Streaming;
                warn!(peer_id = %self.peer_id, state = ?self.state, "Transport failed, reconnect window open");
                self.input_channel_open = false;
                self.enter(Reconnecting);
                if was_streaming {
                    vec![PeerEffect::UnregisterFanout]
                } else {
                    Vec::new()
                }
            }
            TransportReplaced => {
                // A fresh transport restarts signaling; peer id, slot,
                // and gamepad claims survive.
                info!(peer_id = %self.peer_id, "Transport replaced, renegotiating");
                self.input_channel_open = false;
                self.enter(Signaling);
                Vec::new()
            }
            TransportClosed => self.close(),
        }
    }

    /// Check the current state's deadline. The service calls this from
    /// its watchdog tick.
    pub fn check_deadlines(&mut self, now: Instant) -> Vec<PeerEffect> {
        use PeerState::*;
        let elapsed = now.saturating_duration_since(self.state_since);
        match self.state {
            IceGathering if elapsed > self.deadlines.ice_gathering => {
                warn!(peer_id = %self.peer_id, "ICE gathering deadline expired");
                self.on_event(PeerEvent::TransportFailed)
            }
            Connecting if elapsed > self.deadlines.dtls => {
                warn!(peer_id = %self.peer_id, "DTLS handshake deadline expired");
                self.on_event(PeerEvent::TransportFailed)
            }
            Reconnecting if elapsed > self.deadlines.reconnect => {
                warn!(peer_id = %self.peer_id, "Reconnect window expired, closing peer");
                self.close()
            }
            _ => Vec::new(),
        }
    }

    fn maybe_stream(&mut self) -> Vec<PeerEffect> {
        if self.state == PeerState::Connected && self.admitted && self.input_channel_open {
            self.enter(PeerState::Streaming);
            info!(peer_id = %self.peer_id, "Peer streaming");
            return vec![PeerEffect::RegisterFanout, PeerEffect::RequestKeyframe];
        }
        Vec::new()
    }

    fn close(&mut self) -> Vec<PeerEffect> {
        let was_streaming = self.state == PeerState::Streaming;
        self.enter(PeerState::Closed);
        info!(peer_id = %self.peer_id, "Peer closed");
        let mut effects = Vec::new();
        if was_streaming {
            effects.push(PeerEffect::UnregisterFanout);
        }
        effects.push(PeerEffect::ReleaseGamepads);
        effects.push(PeerEffect::CloseTransport);
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PeerEvent::*;
    use PeerState::*;

    fn machine() -> PeerMachine {
        PeerMachine::new(Uuid::new_v4(), PeerDeadlines::default())
    }

    fn drive(m: &mut PeerMachine, events: &[PeerEvent]) -> Vec<PeerEffect> {
        let mut effects = Vec::new();
        for &e in events {
            effects.extend(m.on_event(e));
        }
        effects
    }

    #[test]
    fn happy_path_reaches_streaming() {
        let mut m = machine();
        assert_eq!(m.state(), Signaling);

        let effects = drive(
            &mut m,
            &[
                LocalDescriptionReady,
                IceChecking,
                DtlsEstablished,
                Admitted,
                InputChannelOpen,
            ],
        );
        assert_eq!(m.state(), Streaming);
        assert!(effects.contains(&PeerEffect::RegisterFanout));
        assert!(effects.contains(&PeerEffect::RequestKeyframe));
    }

    #[test]
    fn streaming_requires_both_admission_and_channel() {
        // Channel first, admission second.
        let mut m = machine();
        drive(&mut m, &[LocalDescriptionReady, IceChecking, DtlsEstablished]);
        assert_eq!(m.state(), Connected);

        assert!(m.on_event(InputChannelOpen).is_empty());
        assert_eq!(m.state(), Connected);

        let effects = m.on_event(Admitted);
        assert_eq!(m.state(), Streaming);
        assert!(effects.contains(&PeerEffect::RegisterFanout));
    }

    #[test]
    fn admission_before_connection_is_remembered() {
        let mut m = machine();
        m.on_event(Admitted);
        let effects = drive(
            &mut m,
            &[
                LocalDescriptionReady,
                IceChecking,
                DtlsEstablished,
                InputChannelOpen,
            ],
        );
        assert_eq!(m.state(), Streaming);
        assert!(effects.contains(&PeerEffect::RegisterFanout));
    }

    #[test]
    fn transport_failure_from_streaming_unregisters() {
        let mut m = machine();
        drive(
            &mut m,
            &[
                LocalDescriptionReady,
                IceChecking,
                DtlsEstablished,
                Admitted,
                InputChannelOpen,
            ],
        );
        let effects = m.on_event(TransportFailed);
        assert_eq!(m.state(), Reconnecting);
        assert_eq!(effects, vec![PeerEffect::UnregisterFanout]);
    }

    #[test]
    fn reconnect_resumes_streaming_without_readmission() {
        let mut m = machine();
        drive(
            &mut m,
            &[
                LocalDescriptionReady,
                IceChecking,
                DtlsEstablished,
                Admitted,
                InputChannelOpen,
                TransportFailed,
            ],
        );
        assert_eq!(m.state(), Reconnecting);

        // New transport installed; browser renegotiates.
        drive(&mut m, &[TransportReplaced, LocalDescriptionReady, IceChecking]);
        assert_eq!(m.state(), Connecting);

        let effects = drive(&mut m, &[DtlsEstablished, InputChannelOpen]);
        // Admission survives the reconnect.
        assert_eq!(m.state(), Streaming);
        assert!(effects.contains(&PeerEffect::RegisterFanout));
    }

    #[test]
    fn close_releases_gamepads_and_transport() {
        let mut m = machine();
        drive(
            &mut m,
            &[
                LocalDescriptionReady,
                IceChecking,
                DtlsEstablished,
                Admitted,
                InputChannelOpen,
            ],
        );
        let effects = m.on_event(TransportClosed);
        assert_eq!(m.state(), Closed);
        assert_eq!(
            effects,
            vec![
                PeerEffect::UnregisterFanout,
                PeerEffect::ReleaseGamepads,
                PeerEffect::CloseTransport,
            ]
        );
    }

    #[test]
    fn closed_is_terminal() {
        let mut m = machine();
        m.on_event(TransportClosed);
        assert_eq!(m.state(), Closed);
        assert!(m.on_event(DtlsEstablished).is_empty());
        assert!(m.on_event(InputChannelOpen).is_empty());
        assert_eq!(m.state(), Closed);
    }

    #[test]
    fn input_channel_loss_leaves_streaming() {
        let mut m = machine();
        drive(
            &mut m,
            &[
                LocalDescriptionReady,
                IceChecking,
                DtlsEstablished,
                Admitted,
                InputChannelOpen,
            ],
        );
        let effects = m.on_event(InputChannelClosed);
        assert_eq!(m.state(), Connected);
        assert_eq!(effects, vec![PeerEffect::UnregisterFanout]);

        // Channel reopens: streaming resumes.
        let effects = m.on_event(InputChannelOpen);
        assert_eq!(m.state(), Streaming);
        assert!(effects.contains(&PeerEffect::RegisterFanout));
    }

    #[test]
    fn ice_deadline_sends_peer_to_reconnecting() {
        let mut m = PeerMachine::new(
            Uuid::new_v4(),
            PeerDeadlines {
                ice_gathering: Duration::from_secs(10),
                ..Default::default()
            },
        );
        m.on_event(LocalDescriptionReady);
        assert_eq!(m.state(), IceGathering);

        assert!(m.check_deadlines(Instant::now()).is_empty());
        assert_eq!(m.state(), IceGathering);

        m.check_deadlines(Instant::now() + Duration::from_secs(11));
        assert_eq!(m.state(), Reconnecting);
    }

    #[test]
    fn dtls_deadline_sends_peer_to_reconnecting() {
        let mut m = machine();
        drive(&mut m, &[LocalDescriptionReady, IceChecking]);
        assert_eq!(m.state(), Connecting);
        m.check_deadlines(Instant::now() + Duration::from_secs(21));
        assert_eq!(m.state(), Reconnecting);
    }

    #[test]
    fn reconnect_window_expiry_closes_peer() {
        let mut m = machine();
        drive(
            &mut m,
            &[
                LocalDescriptionReady,
                IceChecking,
                DtlsEstablished,
                Admitted,
                InputChannelOpen,
                TransportFailed,
            ],
        );
        let effects = m.check_deadlines(Instant::now() + Duration::from_secs(31));
        assert_eq!(m.state(), Closed);
        assert!(effects.contains(&PeerEffect::ReleaseGamepads));
        assert!(effects.contains(&PeerEffect::CloseTransport));
    }
}
