//! Virtual-input capability interface.
//!
//! The router emits normalized input through this trait; platform
//! backends (uinput here, XTest/SendInput elsewhere) are selected at
//! startup. Implementations serialize internally and accept calls from
//! any thread.

#[cfg(target_os = "linux")]
pub mod uinput;

use std::sync::Arc;

use huddle_protocol::GamepadState;

/// Mouse buttons as carried on the wire (1..=5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    Side,
    Extra,
}

impl MouseButton {
    pub fn from_wire(button: u8) -> Option<Self> {
        match button {
            1 => Some(Self::Left),
            2 => Some(Self::Middle),
            3 => Some(Self::Right),
            4 => Some(Self::Side),
            5 => Some(Self::Extra),
            _ => None,
        }
    }
}

/// Force-feedback event reported by a backend, relayed back to the
/// browser that owns the server slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RumbleEvent {
    pub low_freq: u16,
    pub high_freq: u16,
    pub duration_ms: u16,
}

pub type RumbleHandler = Arc<dyn Fn(u8, RumbleEvent) + Send + Sync>;

pub trait InputSink: Send + Sync {
    fn keyboard(&self, vk: u16, modifiers: u8, pressed: bool);
    fn mouse_move_rel(&self, dx: i16, dy: i16);
    /// Absolute position normalized to 0..65535 over the capture surface.
    fn mouse_move_abs(&self, x: u16, y: u16);
    fn mouse_button(&self, button: MouseButton, pressed: bool);
    /// Deltas in 1/120-notch units, or device units when
    /// `high_resolution` is set.
    fn mouse_scroll(&self, dx: i16, dy: i16, high_resolution: bool);
    fn gamepad(&self, server_slot: u8, state: &GamepadState);
    /// Register the handler invoked when the backend reports a rumble
    /// event for a server slot. Backends without a force-feedback
    /// source keep the default no-op.
    fn set_rumble_handler(&self, _handler: RumbleHandler) {}
}

/// Discards all input. Used when injection is disabled.
pub struct NullSink;

impl InputSink for NullSink {
    fn keyboard(&self, _vk: u16, _modifiers: u8, _pressed: bool) {}
    fn mouse_move_rel(&self, _dx: i16, _dy: i16) {}
    fn mouse_move_abs(&self, _x: u16, _y: u16) {}
    fn mouse_button(&self, _button: MouseButton, _pressed: bool) {}
    fn mouse_scroll(&self, _dx: i16, _dy: i16, _high_resolution: bool) {}
    fn gamepad(&self, _server_slot: u8, _state: &GamepadState) {}
}
