//! Linux uinput backend for the virtual-input sink.
//!
//! One virtual keyboard, one absolute-positioning mouse, one relative
//! mouse, and up to sixteen gamepads created lazily as server slots
//! are claimed. The absolute and relative pointers are separate
//! devices; mixing ABS and REL axes on one device makes libinput
//! misclassify it and breaks absolute positioning.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::sync::Mutex;

use anyhow::Context;
use huddle_protocol::{GamepadState, buttons};
use input_linux::sys::input_event;
use input_linux::{
    AbsoluteAxis, AbsoluteEvent, AbsoluteInfo, AbsoluteInfoSetup, EventKind, EventTime, InputId,
    Key, KeyEvent, KeyState, RelativeAxis, RelativeEvent, SynchronizeEvent, UInputHandle,
};
use tracing::{debug, warn};

use super::{InputSink, MouseButton};

const ABS_MAX: i32 = 65535;
const STICK_MIN: i32 = -32768;
const STICK_MAX: i32 = 32767;
const TRIGGER_MAX: i32 = 255;

pub struct UinputSink {
    inner: Mutex<Devices>,
}

struct Devices {
    keyboard: UInputHandle<File>,
    mouse: UInputHandle<File>,
    rel_mouse: UInputHandle<File>,
    gamepads: HashMap<u8, Gamepad>,
}

struct Gamepad {
    handle: UInputHandle<File>,
    last: GamepadState,
}

fn open_uinput() -> anyhow::Result<File> {
    OpenOptions::new()
        .write(true)
        .open("/dev/uinput")
        .context("Failed to open /dev/uinput (check permissions)")
}

impl UinputSink {
    pub fn new() -> anyhow::Result<Self> {
        let keyboard = Self::create_keyboard().context("Failed to create virtual keyboard")?;
        let mouse = Self::create_mouse().context("Failed to create virtual mouse")?;
        let rel_mouse =
            Self::create_rel_mouse().context("Failed to create virtual relative mouse")?;
        debug!("uinput sink initialized");
        Ok(Self {
            inner: Mutex::new(Devices {
                keyboard,
                mouse,
                rel_mouse,
                gamepads: HashMap::new(),
            }),
        })
    }

    fn create_keyboard() -> anyhow::Result<UInputHandle<File>> {
        let handle = UInputHandle::new(open_uinput()?);
        handle.set_evbit(EventKind::Key)?;
        handle.set_evbit(EventKind::Synchronize)?;
        for code in 1..=248u16 {
            if let Ok(key) = Key::from_code(code) {
                handle.set_keybit(key)?;
            }
        }
        let id = InputId {
            bustype: 0x03, // BUS_USB
            vendor: 0x4866,
            product: 0x0001,
            version: 1,
        };
        handle.create(&id, b"Huddle Virtual Keyboard\0", 0, &[])?;
        debug!("Virtual keyboard created");
        Ok(handle)
    }

    fn create_mouse() -> anyhow::Result<UInputHandle<File>> {
        let handle = UInputHandle::new(open_uinput()?);
        handle.set_evbit(EventKind::Key)?;
        handle.set_evbit(EventKind::Absolute)?;
        handle.set_evbit(EventKind::Relative)?;
        handle.set_evbit(EventKind::Synchronize)?;

        handle.set_keybit(Key::ButtonLeft)?;
        handle.set_keybit(Key::ButtonRight)?;
        handle.set_keybit(Key::ButtonMiddle)?;
        handle.set_keybit(Key::ButtonSide)?;
        handle.set_keybit(Key::ButtonExtra)?;

        handle.set_absbit(AbsoluteAxis::X)?;
        handle.set_absbit(AbsoluteAxis::Y)?;

        handle.set_relbit(RelativeAxis::Wheel)?;
        handle.set_relbit(RelativeAxis::HorizontalWheel)?;
        handle.set_relbit(RelativeAxis::WheelHiRes)?;
        handle.set_relbit(RelativeAxis::HorizontalWheelHiRes)?;

        let abs_setup = |axis| AbsoluteInfoSetup {
            axis,
            info: AbsoluteInfo {
                value: 0,
                minimum: 0,
                maximum: ABS_MAX,
                fuzz: 0,
                flat: 0,
                resolution: 0,
            },
        };

        let id = InputId {
            bustype: 0x03,
            vendor: 0x4866,
            product: 0x0002,
            version: 1,
        };
        handle.create(
            &id,
            b"Huddle Virtual Mouse\0",
            0,
            &[abs_setup(AbsoluteAxis::X), abs_setup(AbsoluteAxis::Y)],
        )?;
        debug!("Virtual mouse created");
        Ok(handle)
    }

    fn create_rel_mouse() -> anyhow::Result<UInputHandle<File>> {
        let handle = UInputHandle::new(open_uinput()?);
        handle.set_evbit(EventKind::Key)?;
        handle.set_evbit(EventKind::Relative)?;
        handle.set_evbit(EventKind::Synchronize)?;

        handle.set_keybit(Key::ButtonLeft)?;
        handle.set_keybit(Key::ButtonRight)?;
        handle.set_keybit(Key::ButtonMiddle)?;

        handle.set_relbit(RelativeAxis::X)?;
        handle.set_relbit(RelativeAxis::Y)?;

        let id = InputId {
            bustype: 0x03,
            vendor: 0x4866,
            product: 0x0003,
            version: 1,
        };
        handle.create(&id, b"Huddle Virtual Relative Mouse\0", 0, &[])?;
        debug!("Virtual relative mouse created");
        Ok(handle)
    }

    fn create_gamepad(server_slot: u8) -> anyhow::Result<UInputHandle<File>> {
        let handle = UInputHandle::new(open_uinput()?);
        handle.set_evbit(EventKind::Key)?;
        handle.set_evbit(EventKind::Absolute)?;
        handle.set_evbit(EventKind::Synchronize)?;

        for key in [
            Key::ButtonSouth,
            Key::ButtonEast,
            Key::ButtonNorth,
            Key::ButtonWest,
            Key::ButtonTL,
            Key::ButtonTR,
            Key::ButtonSelect,
            Key::ButtonStart,
            Key::ButtonMode,
            Key::ButtonThumbl,
            Key::ButtonThumbr,
        ] {
            handle.set_keybit(key)?;
        }

        let stick = |axis| AbsoluteInfoSetup {
            axis,
            info: AbsoluteInfo {
                value: 0,
                minimum: STICK_MIN,
                maximum: STICK_MAX,
                fuzz: 16,
                flat: 128,
                resolution: 0,
            },
        };
        let trigger = |axis| AbsoluteInfoSetup {
            axis,
            info: AbsoluteInfo {
                value: 0,
                minimum: 0,
                maximum: TRIGGER_MAX,
                fuzz: 0,
                flat: 0,
                resolution: 0,
            },
        };
        let hat = |axis| AbsoluteInfoSetup {
            axis,
            info: AbsoluteInfo {
                value: 0,
                minimum: -1,
                maximum: 1,
                fuzz: 0,
                flat: 0,
                resolution: 0,
            },
        };

        let id = InputId {
            bustype: 0x03,
            vendor: 0x4866,
            product: 0x0010 + server_slot as u16,
            version: 1,
        };
        let mut name = format!("Huddle Virtual Gamepad {server_slot}").into_bytes();
        name.push(0);
        handle.create(
            &id,
            &name,
            0,
            &[
                stick(AbsoluteAxis::X),
                stick(AbsoluteAxis::Y),
                stick(AbsoluteAxis::RX),
                stick(AbsoluteAxis::RY),
                trigger(AbsoluteAxis::Z),
                trigger(AbsoluteAxis::RZ),
                hat(AbsoluteAxis::Hat0X),
                hat(AbsoluteAxis::Hat0Y),
            ],
        )?;
        debug!(server_slot, "Virtual gamepad created");
        // TODO: read FF upload events from this device and forward them
        // through the rumble handler.
        Ok(handle)
    }
}

/// Windows virtual-key code to evdev key code. Covers the keys a
/// browser actually produces; anything else is dropped with a log line.
fn vk_to_evdev(vk: u16) -> Option<u16> {
    Some(match vk {
        0x08 => 14,  // backspace
        0x09 => 15,  // tab
        0x0D => 28,  // enter
        0x10 => 42,  // shift (generic -> left)
        0x11 => 29,  // ctrl (generic -> left)
        0x12 => 56,  // alt (generic -> left)
        0x13 => 119, // pause
        0x14 => 58,  // caps lock
        0x1B => 1,   // escape
        0x20 => 57,  // space
        0x21 => 104, // page up
        0x22 => 109, // page down
        0x23 => 107, // end
        0x24 => 102, // home
        0x25 => 105, // left
        0x26 => 103, // up
        0x27 => 106, // right
        0x28 => 108, // down
        0x2C => 99,  // print screen
        0x2D => 110, // insert
        0x2E => 111, // delete
        0x30 => 11,
        0x31 => 2,
        0x32 => 3,
        0x33 => 4,
        0x34 => 5,
        0x35 => 6,
        0x36 => 7,
        0x37 => 8,
        0x38 => 9,
        0x39 => 10,
        0x41 => 30, // A
        0x42 => 48,
        0x43 => 46,
        0x44 => 32,
        0x45 => 18,
        0x46 => 33,
        0x47 => 34,
        0x48 => 35,
        0x49 => 23,
        0x4A => 36,
        0x4B => 37,
        0x4C => 38,
        0x4D => 50,
        0x4E => 49,
        0x4F => 24,
        0x50 => 25,
        0x51 => 16,
        0x52 => 19,
        0x53 => 31,
        0x54 => 20,
        0x55 => 22,
        0x56 => 47,
        0x57 => 17,
        0x58 => 45,
        0x59 => 21,
        0x5A => 44, // Z
        0x5B => 125, // left meta
        0x5C => 126, // right meta
        0x60 => 82,
        0x61 => 79,
        0x62 => 80,
        0x63 => 81,
        0x64 => 75,
        0x65 => 76,
        0x66 => 77,
        0x67 => 71,
        0x68 => 72,
        0x69 => 73,
        0x6A => 55, // kp *
        0x6B => 78, // kp +
        0x6D => 74, // kp -
        0x6E => 83, // kp .
        0x6F => 98, // kp /
        0x70 => 59,
        0x71 => 60,
        0x72 => 61,
        0x73 => 62,
        0x74 => 63,
        0x75 => 64,
        0x76 => 65,
        0x77 => 66,
        0x78 => 67,
        0x79 => 68,
        0x7A => 87, // F11
        0x7B => 88, // F12
        0x90 => 69, // num lock
        0x91 => 70, // scroll lock
        0xA0 => 42, // left shift
        0xA1 => 54, // right shift
        0xA2 => 29, // left ctrl
        0xA3 => 97, // right ctrl
        0xA4 => 56, // left alt
        0xA5 => 100, // right alt
        0xBA => 39, // ;
        0xBB => 13, // =
        0xBC => 51, // ,
        0xBD => 12, // -
        0xBE => 52, // .
        0xBF => 53, // /
        0xC0 => 41, // `
        0xDB => 26, // [
        0xDC => 43, // backslash
        0xDD => 27, // ]
        0xDE => 40, // '
        _ => return None,
    })
}

fn key_events(key: Key, pressed: bool) -> [input_event; 2] {
    let time = EventTime::default();
    [
        KeyEvent::new(time, key, KeyState::pressed(pressed))
            .into_event()
            .into_raw(),
        SynchronizeEvent::report(time).into_event().into_raw(),
    ]
}

impl InputSink for UinputSink {
    fn keyboard(&self, vk: u16, _modifiers: u8, pressed: bool) {
        let Some(code) = vk_to_evdev(vk) else {
            debug!(vk, "No evdev mapping for virtual-key code");
            return;
        };
        let Ok(key) = Key::from_code(code) else {
            return;
        };
        let devices = self.inner.lock().unwrap();
        if let Err(e) = devices.keyboard.write(&key_events(key, pressed)) {
            warn!(vk, "Keyboard inject failed: {e}");
        }
    }

    fn mouse_move_rel(&self, dx: i16, dy: i16) {
        if dx == 0 && dy == 0 {
            return;
        }
        let time = EventTime::default();
        let mut events: Vec<input_event> = Vec::with_capacity(3);
        if dx != 0 {
            events.push(
                RelativeEvent::new(time, RelativeAxis::X, dx.into())
                    .into_event()
                    .into_raw(),
            );
        }
        if dy != 0 {
            events.push(
                RelativeEvent::new(time, RelativeAxis::Y, dy.into())
                    .into_event()
                    .into_raw(),
            );
        }
        events.push(SynchronizeEvent::report(time).into_event().into_raw());
        let devices = self.inner.lock().unwrap();
        if let Err(e) = devices.rel_mouse.write(&events) {
            warn!("Relative mouse inject failed: {e}");
        }
    }

    fn mouse_move_abs(&self, x: u16, y: u16) {
        let time = EventTime::default();
        let events: [input_event; 3] = [
            AbsoluteEvent::new(time, AbsoluteAxis::X, x.into())
                .into_event()
                .into_raw(),
            AbsoluteEvent::new(time, AbsoluteAxis::Y, y.into())
                .into_event()
                .into_raw(),
            SynchronizeEvent::report(time).into_event().into_raw(),
        ];
        let devices = self.inner.lock().unwrap();
        if let Err(e) = devices.mouse.write(&events) {
            warn!("Absolute mouse inject failed: {e}");
        }
    }

    fn mouse_button(&self, button: MouseButton, pressed: bool) {
        let key = match button {
            MouseButton::Left => Key::ButtonLeft,
            MouseButton::Middle => Key::ButtonMiddle,
            MouseButton::Right => Key::ButtonRight,
            MouseButton::Side => Key::ButtonSide,
            MouseButton::Extra => Key::ButtonExtra,
        };
        let devices = self.inner.lock().unwrap();
        if let Err(e) = devices.mouse.write(&key_events(key, pressed)) {
            warn!(?button, "Mouse button inject failed: {e}");
        }
    }

    fn mouse_scroll(&self, dx: i16, dy: i16, high_resolution: bool) {
        let time = EventTime::default();
        let mut events: Vec<input_event> = Vec::with_capacity(5);
        // Wire deltas are 1/120-notch units already, or raw device
        // units in high-resolution mode; both map straight onto the
        // hi-res axes. Whole notches also get a legacy wheel event.
        if dy != 0 {
            events.push(
                RelativeEvent::new(time, RelativeAxis::WheelHiRes, dy.into())
                    .into_event()
                    .into_raw(),
            );
            if !high_resolution {
                events.push(
                    RelativeEvent::new(time, RelativeAxis::Wheel, (dy / 120).into())
                        .into_event()
                        .into_raw(),
                );
            }
        }
        if dx != 0 {
            events.push(
                RelativeEvent::new(time, RelativeAxis::HorizontalWheelHiRes, dx.into())
                    .into_event()
                    .into_raw(),
            );
            if !high_resolution {
                events.push(
                    RelativeEvent::new(time, RelativeAxis::HorizontalWheel, (dx / 120).into())
                        .into_event()
                        .into_raw(),
                );
            }
        }
        if events.is_empty() {
            return;
        }
        events.push(SynchronizeEvent::report(time).into_event().into_raw());
        let devices = self.inner.lock().unwrap();
        if let Err(e) = devices.mouse.write(&events) {
            warn!("Scroll inject failed: {e}");
        }
    }

    fn gamepad(&self, server_slot: u8, state: &GamepadState) {
        let mut devices = self.inner.lock().unwrap();
        if !devices.gamepads.contains_key(&server_slot) {
            match Self::create_gamepad(server_slot) {
                Ok(handle) => {
                    devices.gamepads.insert(
                        server_slot,
                        Gamepad {
                            handle,
                            last: GamepadState::default(),
                        },
                    );
                }
                Err(e) => {
                    warn!(server_slot, "Gamepad device creation failed: {e:#}");
                    return;
                }
            }
        }
        let pad = devices.gamepads.get_mut(&server_slot).unwrap();

        let time = EventTime::default();
        let mut events: Vec<input_event> = Vec::new();

        let changed = pad.last.buttons ^ state.buttons;
        for (bit, key) in [
            (buttons::A, Key::ButtonSouth),
            (buttons::B, Key::ButtonEast),
            (buttons::X, Key::ButtonNorth),
            (buttons::Y, Key::ButtonWest),
            (buttons::LSHOULDER, Key::ButtonTL),
            (buttons::RSHOULDER, Key::ButtonTR),
            (buttons::BACK, Key::ButtonSelect),
            (buttons::START, Key::ButtonStart),
            (buttons::HOME, Key::ButtonMode),
            (buttons::LSTICK, Key::ButtonThumbl),
            (buttons::RSTICK, Key::ButtonThumbr),
        ] {
            if changed & bit != 0 {
                events.push(
                    KeyEvent::new(time, key, KeyState::pressed(state.buttons & bit != 0))
                        .into_event()
                        .into_raw(),
                );
            }
        }

        // D-pad rides the hat axes.
        let hat = |neg: u16, pos: u16, b: u16| -> i32 {
            i32::from(b & pos != 0) - i32::from(b & neg != 0)
        };
        let hat_x = hat(buttons::DPAD_LEFT, buttons::DPAD_RIGHT, state.buttons);
        let hat_y = hat(buttons::DPAD_UP, buttons::DPAD_DOWN, state.buttons);
        let last_hat_x = hat(buttons::DPAD_LEFT, buttons::DPAD_RIGHT, pad.last.buttons);
        let last_hat_y = hat(buttons::DPAD_UP, buttons::DPAD_DOWN, pad.last.buttons);
        if hat_x != last_hat_x {
            events.push(
                AbsoluteEvent::new(time, AbsoluteAxis::Hat0X, hat_x)
                    .into_event()
                    .into_raw(),
            );
        }
        if hat_y != last_hat_y {
            events.push(
                AbsoluteEvent::new(time, AbsoluteAxis::Hat0Y, hat_y)
                    .into_event()
                    .into_raw(),
            );
        }

        // Sticks: the wire uses up-positive Y, evdev expects
        // down-positive.
        let axes = [
            (AbsoluteAxis::X, i32::from(state.lx), i32::from(pad.last.lx)),
            (
                AbsoluteAxis::Y,
                i32::from(state.ly.saturating_neg()),
                i32::from(pad.last.ly.saturating_neg()),
            ),
            (AbsoluteAxis::RX, i32::from(state.rx), i32::from(pad.last.rx)),
            (
                AbsoluteAxis::RY,
                i32::from(state.ry.saturating_neg()),
                i32::from(pad.last.ry.saturating_neg()),
            ),
            (
                AbsoluteAxis::Z,
                i32::from(state.left_trigger),
                i32::from(pad.last.left_trigger),
            ),
            (
                AbsoluteAxis::RZ,
                i32::from(state.right_trigger),
                i32::from(pad.last.right_trigger),
            ),
        ];
        for (axis, value, last) in axes {
            if value != last {
                events.push(AbsoluteEvent::new(time, axis, value).into_event().into_raw());
            }
        }

        if events.is_empty() {
            return;
        }
        events.push(SynchronizeEvent::report(time).into_event().into_raw());
        if let Err(e) = pad.handle.write(&events) {
            warn!(server_slot, "Gamepad inject failed: {e}");
        }
        pad.last = *state;
    }
}
