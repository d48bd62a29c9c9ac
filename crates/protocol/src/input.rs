//! Binary input protocol carried on the reliable data channel.
//!
//! Every frame is `[type: u8][payload]`, little-endian throughout:
//! ```text
//! 0x01 GamepadState   u8 gamepad_id; u16 buttons; u8 lt; u8 rt;
//!                     i16 lx; i16 ly; i16 rx; i16 ry
//! 0x02 GamepadRumble  u8 gamepad_id; u16 low_freq; u16 high_freq;
//!                     u16 duration_ms          (gateway -> browser only)
//! 0x10 KeyboardKey    u16 vk; u8 modifiers; u8 pressed
//! 0x20 MouseMove      i16 dx; i16 dy; u16 abs_x; u16 abs_y; u8 is_absolute
//! 0x21 MouseButton    u8 button (1..=5); u8 pressed
//! 0x22 MouseScroll    i16 dx; i16 dy; u8 high_resolution
//! 0x30 Touch          reserved, payload ignored
//! ```

/// Gamepad button bits (Moonlight/Sunshine convention, bit-for-bit).
pub mod buttons {
    pub const DPAD_UP: u16 = 0x0001;
    pub const DPAD_DOWN: u16 = 0x0002;
    pub const DPAD_LEFT: u16 = 0x0004;
    pub const DPAD_RIGHT: u16 = 0x0008;
    pub const START: u16 = 0x0010;
    pub const BACK: u16 = 0x0020;
    pub const LSTICK: u16 = 0x0040;
    pub const RSTICK: u16 = 0x0080;
    pub const LSHOULDER: u16 = 0x0100;
    pub const RSHOULDER: u16 = 0x0200;
    pub const HOME: u16 = 0x0400;
    pub const A: u16 = 0x1000;
    pub const B: u16 = 0x2000;
    pub const X: u16 = 0x4000;
    pub const Y: u16 = 0x8000;
}

/// Wire-level frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputType {
    GamepadState = 0x01,
    GamepadRumble = 0x02,
    KeyboardKey = 0x10,
    MouseMove = 0x20,
    MouseButton = 0x21,
    MouseScroll = 0x22,
    Touch = 0x30,
}

impl InputType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::GamepadState),
            0x02 => Some(Self::GamepadRumble),
            0x10 => Some(Self::KeyboardKey),
            0x20 => Some(Self::MouseMove),
            0x21 => Some(Self::MouseButton),
            0x22 => Some(Self::MouseScroll),
            0x30 => Some(Self::Touch),
            _ => None,
        }
    }
}

/// Full state of one gamepad. Sticks are signed 16-bit symmetric,
/// triggers 8-bit unsigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GamepadState {
    pub buttons: u16,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub lx: i16,
    pub ly: i16,
    pub rx: i16,
    pub ry: i16,
}

/// A parsed input frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFrame {
    GamepadState {
        /// Browser-local gamepad index (Gamepad API order).
        gamepad_id: u8,
        state: GamepadState,
    },
    GamepadRumble {
        gamepad_id: u8,
        low_freq: u16,
        high_freq: u16,
        duration_ms: u16,
    },
    KeyboardKey {
        /// Windows virtual-key code as reported by the browser.
        vk: u16,
        modifiers: u8,
        pressed: bool,
    },
    MouseMove {
        dx: i16,
        dy: i16,
        /// Absolute coordinates normalized to 0..65535 over the capture surface.
        abs_x: u16,
        abs_y: u16,
        is_absolute: bool,
    },
    MouseButton {
        /// 1=left 2=middle 3=right 4=side 5=extra.
        button: u8,
        pressed: bool,
    },
    MouseScroll {
        /// 1/120-notch units, or device units when `high_resolution` is set.
        dx: i16,
        dy: i16,
        high_resolution: bool,
    },
    Touch,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InputFrameError {
    #[error("empty input frame")]
    Empty,
    #[error("unknown input type 0x{0:02x}")]
    UnknownType(u8),
    #[error("truncated {kind:?} frame: expected {expected} bytes, got {actual}")]
    Truncated {
        kind: InputType,
        expected: usize,
        actual: usize,
    },
    #[error("mouse button {0} out of range (1..=5)")]
    ButtonOutOfRange(u8),
}

fn le_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le_i16(buf: &[u8], off: usize) -> i16 {
    i16::from_le_bytes([buf[off], buf[off + 1]])
}

impl InputFrame {
    /// Parse one frame from the reliable channel.
    pub fn parse(buf: &[u8]) -> Result<Self, InputFrameError> {
        let Some((&tag, payload)) = buf.split_first() else {
            return Err(InputFrameError::Empty);
        };
        let kind = InputType::from_byte(tag).ok_or(InputFrameError::UnknownType(tag))?;

        let need = |expected: usize| -> Result<(), InputFrameError> {
            if payload.len() < expected {
                Err(InputFrameError::Truncated {
                    kind,
                    expected: expected + 1,
                    actual: buf.len(),
                })
            } else {
                Ok(())
            }
        };

        match kind {
            InputType::GamepadState => {
                need(13)?;
                Ok(Self::GamepadState {
                    gamepad_id: payload[0],
                    state: GamepadState {
                        buttons: le_u16(payload, 1),
                        left_trigger: payload[3],
                        right_trigger: payload[4],
                        lx: le_i16(payload, 5),
                        ly: le_i16(payload, 7),
                        rx: le_i16(payload, 9),
                        ry: le_i16(payload, 11),
                    },
                })
            }
            InputType::GamepadRumble => {
                need(7)?;
                Ok(Self::GamepadRumble {
                    gamepad_id: payload[0],
                    low_freq: le_u16(payload, 1),
                    high_freq: le_u16(payload, 3),
                    duration_ms: le_u16(payload, 5),
                })
            }
            InputType::KeyboardKey => {
                need(4)?;
                Ok(Self::KeyboardKey {
                    vk: le_u16(payload, 0),
                    modifiers: payload[2],
                    pressed: payload[3] != 0,
                })
            }
            InputType::MouseMove => {
                need(9)?;
                Ok(Self::MouseMove {
                    dx: le_i16(payload, 0),
                    dy: le_i16(payload, 2),
                    abs_x: le_u16(payload, 4),
                    abs_y: le_u16(payload, 6),
                    is_absolute: payload[8] != 0,
                })
            }
            InputType::MouseButton => {
                need(2)?;
                let button = payload[0];
                if !(1..=5).contains(&button) {
                    return Err(InputFrameError::ButtonOutOfRange(button));
                }
                Ok(Self::MouseButton {
                    button,
                    pressed: payload[1] != 0,
                })
            }
            InputType::MouseScroll => {
                need(5)?;
                Ok(Self::MouseScroll {
                    dx: le_i16(payload, 0),
                    dy: le_i16(payload, 2),
                    high_resolution: payload[4] != 0,
                })
            }
            InputType::Touch => Ok(Self::Touch),
        }
    }

    pub fn input_type(&self) -> InputType {
        match self {
            Self::GamepadState { .. } => InputType::GamepadState,
            Self::GamepadRumble { .. } => InputType::GamepadRumble,
            Self::KeyboardKey { .. } => InputType::KeyboardKey,
            Self::MouseMove { .. } => InputType::MouseMove,
            Self::MouseButton { .. } => InputType::MouseButton,
            Self::MouseScroll { .. } => InputType::MouseScroll,
            Self::Touch => InputType::Touch,
        }
    }

    /// Serialize to the wire format. The gateway uses this for the
    /// rumble return path; browsers use the same layout for everything else.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.push(self.input_type() as u8);
        match *self {
            Self::GamepadState { gamepad_id, state } => {
                out.push(gamepad_id);
                out.extend_from_slice(&state.buttons.to_le_bytes());
                out.push(state.left_trigger);
                out.push(state.right_trigger);
                out.extend_from_slice(&state.lx.to_le_bytes());
                out.extend_from_slice(&state.ly.to_le_bytes());
                out.extend_from_slice(&state.rx.to_le_bytes());
                out.extend_from_slice(&state.ry.to_le_bytes());
            }
            Self::GamepadRumble {
                gamepad_id,
                low_freq,
                high_freq,
                duration_ms,
            } => {
                out.push(gamepad_id);
                out.extend_from_slice(&low_freq.to_le_bytes());
                out.extend_from_slice(&high_freq.to_le_bytes());
                out.extend_from_slice(&duration_ms.to_le_bytes());
            }
            Self::KeyboardKey {
                vk,
                modifiers,
                pressed,
            } => {
                out.extend_from_slice(&vk.to_le_bytes());
                out.push(modifiers);
                out.push(pressed as u8);
            }
            Self::MouseMove {
                dx,
                dy,
                abs_x,
                abs_y,
                is_absolute,
            } => {
                out.extend_from_slice(&dx.to_le_bytes());
                out.extend_from_slice(&dy.to_le_bytes());
                out.extend_from_slice(&abs_x.to_le_bytes());
                out.extend_from_slice(&abs_y.to_le_bytes());
                out.push(is_absolute as u8);
            }
            Self::MouseButton { button, pressed } => {
                out.push(button);
                out.push(pressed as u8);
            }
            Self::MouseScroll {
                dx,
                dy,
                high_resolution,
            } => {
                out.extend_from_slice(&dx.to_le_bytes());
                out.extend_from_slice(&dy.to_le_bytes());
                out.push(high_resolution as u8);
            }
            Self::Touch => {}
        }
        out
    }
}
