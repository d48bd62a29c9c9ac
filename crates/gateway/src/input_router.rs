//! Routes input frames from the reliable channel to the virtual-input
//! sink, enforcing room permissions and the gamepad slot map.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use huddle_protocol::InputFrame;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fanout::{Fanout, FanoutError};
use crate::room::Room;
use crate::sink::{InputSink, MouseButton};

/// Protocol violations tolerated per window before the peer is closed.
pub const STRIKE_LIMIT: usize = 3;
pub const STRIKE_WINDOW: Duration = Duration::from_secs(10);

/// Browser gamepad indices live in 0..=3.
const MAX_BROWSER_GAMEPAD: u8 = 3;

/// What the router did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Dropped(DropReason),
    /// Repeated protocol violations; the caller must close the peer.
    ClosePeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownPeer,
    Spectator,
    KeyboardDenied,
    MouseDenied,
    GamepadDenied,
    Malformed,
    /// Valid but intentionally ignored (reserved touch frames).
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum RumbleError {
    #[error("server slot {0} is not claimed")]
    UnclaimedSlot(u8),
    #[error(transparent)]
    Send(#[from] FanoutError),
}

/// Per-room router. Re-entrant: the only lock on the fast path is the
/// room lock plus the short strike-table lock on violations.
pub struct InputRouter {
    room: Arc<Room>,
    sink: Arc<dyn InputSink>,
    fanout: Arc<Fanout>,
    dropped_frames: AtomicU64,
    strikes: Mutex<HashMap<Uuid, VecDeque<Instant>>>,
}

impl InputRouter {
    pub fn new(room: Arc<Room>, sink: Arc<dyn InputSink>, fanout: Arc<Fanout>) -> Self {
        Self {
            room,
            sink,
            fanout,
            dropped_frames: AtomicU64::new(0),
            strikes: Mutex::new(HashMap::new()),
        }
    }

    /// Frames dropped for any reason since startup.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Handle one inbound frame from `peer_id`.
    pub fn handle_frame(&self, peer_id: Uuid, data: &[u8]) -> RouteOutcome {
        self.handle_frame_at(peer_id, data, Instant::now())
    }

    fn handle_frame_at(&self, peer_id: Uuid, data: &[u8], now: Instant) -> RouteOutcome {
        let frame = match InputFrame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%peer_id, "Malformed input frame: {e}");
                return self.violation(peer_id, now);
            }
        };

        let Some(player) = self.room.player(peer_id) else {
            return self.drop_frame(DropReason::UnknownPeer);
        };
        if player.is_spectator {
            return self.drop_frame(DropReason::Spectator);
        }

        match frame {
            InputFrame::GamepadState { gamepad_id, state } => {
                if gamepad_id > MAX_BROWSER_GAMEPAD {
                    debug!(%peer_id, gamepad_id, "Gamepad index out of range");
                    return self.violation(peer_id, now);
                }
                let server_slot = match self.room.translate_gamepad(peer_id, gamepad_id) {
                    Some(slot) => slot,
                    // First frame from this pad: claim implicitly.
                    None => match self.room.claim_gamepad(peer_id, gamepad_id) {
                        Ok(slot) => slot,
                        Err(e) => {
                            debug!(%peer_id, gamepad_id, "Gamepad claim denied: {e}");
                            return self.drop_frame(DropReason::GamepadDenied);
                        }
                    },
                };
                self.sink.gamepad(server_slot, &state);
                RouteOutcome::Delivered
            }
            InputFrame::KeyboardKey {
                vk,
                modifiers,
                pressed,
            } => {
                if !player.can_use_keyboard {
                    return self.drop_frame(DropReason::KeyboardDenied);
                }
                self.sink.keyboard(vk, modifiers, pressed);
                RouteOutcome::Delivered
            }
            InputFrame::MouseMove {
                dx,
                dy,
                abs_x,
                abs_y,
                is_absolute,
            } => {
                if !player.can_use_mouse {
                    return self.drop_frame(DropReason::MouseDenied);
                }
                if is_absolute {
                    self.sink.mouse_move_abs(abs_x, abs_y);
                } else {
                    self.sink.mouse_move_rel(dx, dy);
                }
                RouteOutcome::Delivered
            }
            InputFrame::MouseButton { button, pressed } => {
                if !player.can_use_mouse {
                    return self.drop_frame(DropReason::MouseDenied);
                }
                // Range is validated at parse time.
                let Some(button) = MouseButton::from_wire(button) else {
                    return self.violation(peer_id, now);
                };
                self.sink.mouse_button(button, pressed);
                RouteOutcome::Delivered
            }
            InputFrame::MouseScroll {
                dx,
                dy,
                high_resolution,
            } => {
                if !player.can_use_mouse {
                    return self.drop_frame(DropReason::MouseDenied);
                }
                self.sink.mouse_scroll(dx, dy, high_resolution);
                RouteOutcome::Delivered
            }
            InputFrame::Touch => self.drop_frame(DropReason::Ignored),
            InputFrame::GamepadRumble { .. } => {
                // Gateway-to-browser only; a browser sending it is
                // misbehaving.
                debug!(%peer_id, "Unexpected rumble frame from peer");
                self.violation(peer_id, now)
            }
        }
    }

    /// Relay a rumble event to the browser owning `server_slot`.
    pub async fn send_rumble(
        &self,
        server_slot: u8,
        low_freq: u16,
        high_freq: u16,
        duration_ms: u16,
    ) -> Result<(), RumbleError> {
        let (peer_id, browser_id) = self
            .room
            .rumble_target(server_slot)
            .ok_or(RumbleError::UnclaimedSlot(server_slot))?;
        let frame = InputFrame::GamepadRumble {
            gamepad_id: browser_id,
            low_freq,
            high_freq,
            duration_ms,
        };
        self.fanout
            .send_control(peer_id, Bytes::from(frame.serialize()))
            .await?;
        Ok(())
    }

    fn drop_frame(&self, reason: DropReason) -> RouteOutcome {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        RouteOutcome::Dropped(reason)
    }

    /// Record a protocol violation; three strikes inside the window
    /// close the peer.
    fn violation(&self, peer_id: Uuid, now: Instant) -> RouteOutcome {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        let mut strikes = self.strikes.lock().unwrap();
        let window = strikes.entry(peer_id).or_default();
        window.push_back(now);
        while let Some(&front) = window.front() {
            if now.saturating_duration_since(front) > STRIKE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= STRIKE_LIMIT {
            warn!(%peer_id, strikes = window.len(), "Peer exceeded protocol-violation limit");
            strikes.remove(&peer_id);
            return RouteOutcome::ClosePeer;
        }
        RouteOutcome::Dropped(DropReason::Malformed)
    }

    /// Forget a peer's strike history (on disconnect).
    pub fn forget_peer(&self, peer_id: Uuid) {
        self.strikes.lock().unwrap().remove(&peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::QueueDepths;
    use crate::room::RoomLimits;
    use huddle_protocol::GamepadState;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, PartialEq, Eq)]
    enum SinkEvent {
        Keyboard(u16, bool),
        MouseRel(i16, i16),
        MouseAbs(u16, u16),
        MouseButton(MouseButton, bool),
        MouseScroll(i16, i16, bool),
        Gamepad(u8, GamepadState),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<SinkEvent>>,
    }

    impl InputSink for RecordingSink {
        fn keyboard(&self, vk: u16, _modifiers: u8, pressed: bool) {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::Keyboard(vk, pressed));
        }
        fn mouse_move_rel(&self, dx: i16, dy: i16) {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::MouseRel(dx, dy));
        }
        fn mouse_move_abs(&self, x: u16, y: u16) {
            self.events.lock().unwrap().push(SinkEvent::MouseAbs(x, y));
        }
        fn mouse_button(&self, button: MouseButton, pressed: bool) {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::MouseButton(button, pressed));
        }
        fn mouse_scroll(&self, dx: i16, dy: i16, high_resolution: bool) {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::MouseScroll(dx, dy, high_resolution));
        }
        fn gamepad(&self, server_slot: u8, state: &GamepadState) {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::Gamepad(server_slot, *state));
        }
    }

    struct Fixture {
        room: Arc<Room>,
        sink: Arc<RecordingSink>,
        fanout: Arc<Fanout>,
        router: InputRouter,
        host: Uuid,
    }

    fn fixture() -> Fixture {
        let host = Uuid::new_v4();
        let room = Arc::new(Room::create(
            "ABCDE2".to_string(),
            RoomLimits::default(),
            false,
            false,
            host,
            "host",
        ));
        let sink = Arc::new(RecordingSink::default());
        let fanout = Arc::new(Fanout::new(QueueDepths::default()));
        let router = InputRouter::new(
            Arc::clone(&room),
            Arc::clone(&sink) as Arc<dyn InputSink>,
            Arc::clone(&fanout),
        );
        Fixture {
            room,
            sink,
            fanout,
            router,
            host,
        }
    }

    fn keyboard_frame(vk: u16, pressed: bool) -> Vec<u8> {
        InputFrame::KeyboardKey {
            vk,
            modifiers: 0,
            pressed,
        }
        .serialize()
    }

    fn gamepad_frame(gamepad_id: u8) -> Vec<u8> {
        InputFrame::GamepadState {
            gamepad_id,
            state: GamepadState {
                buttons: huddle_protocol::buttons::A,
                ..Default::default()
            },
        }
        .serialize()
    }

    #[test]
    fn keyboard_permission_gates_frames() {
        // Scenario: guest without keyboard access sends a key; nothing
        // reaches the sink and the drop counter moves. After the host
        // grants access the next frame goes through.
        let f = fixture();
        let guest = Uuid::new_v4();
        f.room.add_spectator(guest, "guest").unwrap();
        f.room.promote_to_player(guest).unwrap();

        let outcome = f.router.handle_frame(guest, &keyboard_frame(0x41, true));
        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::KeyboardDenied));
        assert!(f.sink.events.lock().unwrap().is_empty());
        assert_eq!(f.router.dropped_frames(), 1);

        f.room.set_keyboard_access(f.host, guest, true).unwrap();
        let outcome = f.router.handle_frame(guest, &keyboard_frame(0x41, true));
        assert_eq!(outcome, RouteOutcome::Delivered);
        assert_eq!(
            *f.sink.events.lock().unwrap(),
            vec![SinkEvent::Keyboard(0x41, true)]
        );
    }

    #[test]
    fn mouse_permission_gates_all_mouse_frames() {
        let f = fixture();
        let guest = Uuid::new_v4();
        f.room.add_spectator(guest, "guest").unwrap();
        f.room.promote_to_player(guest).unwrap();

        let frames = [
            InputFrame::MouseMove {
                dx: 1,
                dy: 1,
                abs_x: 0,
                abs_y: 0,
                is_absolute: false,
            }
            .serialize(),
            InputFrame::MouseButton {
                button: 1,
                pressed: true,
            }
            .serialize(),
            InputFrame::MouseScroll {
                dx: 0,
                dy: 120,
                high_resolution: false,
            }
            .serialize(),
        ];
        for frame in &frames {
            assert_eq!(
                f.router.handle_frame(guest, frame),
                RouteOutcome::Dropped(DropReason::MouseDenied)
            );
        }

        f.room.set_mouse_access(f.host, guest, true).unwrap();
        for frame in &frames {
            assert_eq!(f.router.handle_frame(guest, frame), RouteOutcome::Delivered);
        }
        assert_eq!(f.sink.events.lock().unwrap().len(), 3);
    }

    #[test]
    fn spectator_frames_are_dropped() {
        let f = fixture();
        let spec = Uuid::new_v4();
        f.room.add_spectator(spec, "spec").unwrap();

        assert_eq!(
            f.router.handle_frame(spec, &gamepad_frame(0)),
            RouteOutcome::Dropped(DropReason::Spectator)
        );
        assert!(f.sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_peer_frames_are_dropped() {
        let f = fixture();
        assert_eq!(
            f.router.handle_frame(Uuid::new_v4(), &gamepad_frame(0)),
            RouteOutcome::Dropped(DropReason::UnknownPeer)
        );
    }

    #[test]
    fn gamepad_claims_implicitly_and_reuses_slot() {
        let f = fixture();

        assert_eq!(
            f.router.handle_frame(f.host, &gamepad_frame(0)),
            RouteOutcome::Delivered
        );
        assert_eq!(
            f.router.handle_frame(f.host, &gamepad_frame(0)),
            RouteOutcome::Delivered
        );

        let events = f.sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SinkEvent::Gamepad(0, _)));
        assert!(matches!(events[1], SinkEvent::Gamepad(0, _)));
        drop(events);
        assert_eq!(f.room.translate_gamepad(f.host, 0), Some(0));
    }

    #[test]
    fn gamepad_index_out_of_range_is_violation() {
        let f = fixture();
        assert_eq!(
            f.router.handle_frame(f.host, &gamepad_frame(4)),
            RouteOutcome::Dropped(DropReason::Malformed)
        );
    }

    #[test]
    fn absolute_and_relative_mouse_are_distinguished() {
        let f = fixture();
        f.router
            .handle_frame(
                f.host,
                &InputFrame::MouseMove {
                    dx: -3,
                    dy: 7,
                    abs_x: 0,
                    abs_y: 0,
                    is_absolute: false,
                }
                .serialize(),
            );
        f.router
            .handle_frame(
                f.host,
                &InputFrame::MouseMove {
                    dx: 0,
                    dy: 0,
                    abs_x: 32768,
                    abs_y: 65535,
                    is_absolute: true,
                }
                .serialize(),
            );
        assert_eq!(
            *f.sink.events.lock().unwrap(),
            vec![
                SinkEvent::MouseRel(-3, 7),
                SinkEvent::MouseAbs(32768, 65535),
            ]
        );
    }

    #[test]
    fn touch_is_ignored_without_strike() {
        let f = fixture();
        for _ in 0..10 {
            assert_eq!(
                f.router.handle_frame(f.host, &InputFrame::Touch.serialize()),
                RouteOutcome::Dropped(DropReason::Ignored)
            );
        }
    }

    #[test]
    fn three_strikes_close_the_peer() {
        let f = fixture();
        let now = Instant::now();
        let garbage = [0x7F, 0x00];

        assert_eq!(
            f.router.handle_frame_at(f.host, &garbage, now),
            RouteOutcome::Dropped(DropReason::Malformed)
        );
        assert_eq!(
            f.router
                .handle_frame_at(f.host, &garbage, now + Duration::from_secs(3)),
            RouteOutcome::Dropped(DropReason::Malformed)
        );
        assert_eq!(
            f.router
                .handle_frame_at(f.host, &garbage, now + Duration::from_secs(6)),
            RouteOutcome::ClosePeer
        );
    }

    #[test]
    fn strikes_expire_outside_the_window() {
        let f = fixture();
        let now = Instant::now();
        let garbage = [0x7F, 0x00];

        f.router.handle_frame_at(f.host, &garbage, now);
        f.router
            .handle_frame_at(f.host, &garbage, now + Duration::from_secs(6));
        // Third violation lands after the first expired.
        assert_eq!(
            f.router
                .handle_frame_at(f.host, &garbage, now + Duration::from_secs(12)),
            RouteOutcome::Dropped(DropReason::Malformed)
        );
    }

    #[test]
    fn rumble_frame_from_browser_is_violation() {
        let f = fixture();
        let frame = InputFrame::GamepadRumble {
            gamepad_id: 0,
            low_freq: 1,
            high_freq: 2,
            duration_ms: 3,
        }
        .serialize();
        assert_eq!(
            f.router.handle_frame(f.host, &frame),
            RouteOutcome::Dropped(DropReason::Malformed)
        );
    }

    #[tokio::test]
    async fn rumble_reaches_the_owning_peer() {
        let f = fixture();
        f.fanout.register(f.host);
        // Host claims browser pad 1 -> server slot 0.
        f.router.handle_frame(f.host, &gamepad_frame(1));

        f.router.send_rumble(0, 100, 200, 300).await.unwrap();

        let outlet = f.fanout.outlet(f.host).unwrap();
        assert_eq!(outlet.queue_len(), 1);

        // Unclaimed slot errors out.
        assert!(matches!(
            f.router.send_rumble(9, 0, 0, 0).await,
            Err(RumbleError::UnclaimedSlot(9))
        ));
    }
}
