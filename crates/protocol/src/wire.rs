//! Binary wire format for the input data channel.
//!
//! Every message starts with a one-byte type tag, little-endian fields follow:
//!
//! ```text
//! 0x01 Gamepad state : slot(u8) buttons(u16) lt(u8) rt(u8) lx(i16) ly(i16) rx(i16) ry(i16)
//! 0x02 Keyboard      : vk(u16) modifiers(u8) pressed(u8)
//! 0x03 Mouse move    : flags(u8, bit0 = absolute) x(i16) y(i16)
//! 0x04 Mouse button  : button(u8) pressed(u8)
//! 0x05 Mouse scroll  : reserved(u8) dx(i16) dy(i16)
//! ```

pub const TAG_GAMEPAD_STATE: u8 = 0x01;
pub const TAG_KEYBOARD: u8 = 0x02;
pub const TAG_MOUSE_MOVE: u8 = 0x03;
pub const TAG_MOUSE_BUTTON: u8 = 0x04;
pub const TAG_MOUSE_SCROLL: u8 = 0x05;

pub const MOUSE_MOVE_FLAG_ABSOLUTE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GamepadState {
    pub slot: u8,
    pub buttons: u16,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub left_x: i16,
    pub left_y: i16,
    pub right_x: i16,
    pub right_y: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyboardEvent {
    pub virtual_key: u16,
    pub modifiers: u8,
    pub pressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseMoveEvent {
    pub absolute: bool,
    pub x: i16,
    pub y: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseButtonEvent {
    pub button: u8,
    pub pressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseScrollEvent {
    pub dx: i16,
    pub dy: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputWireEvent {
    Gamepad(GamepadState),
    Keyboard(KeyboardEvent),
    MouseMove(MouseMoveEvent),
    MouseButton(MouseButtonEvent),
    MouseScroll(MouseScrollEvent),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty input buffer")]
    Empty,
    #[error("unknown input tag: 0x{0:02x}")]
    UnknownTag(u8),
    #[error("truncated {kind} payload: need {need} bytes, got {got}")]
    Truncated {
        kind: &'static str,
        need: usize,
        got: usize,
    },
}

fn i16_le(buf: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u16_le(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

/// Parse one input event from its wire representation (tag byte + payload, no framing).
pub fn parse_input_event(buf: &[u8]) -> Result<InputWireEvent, WireError> {
    let (&tag, rest) = buf.split_first().ok_or(WireError::Empty)?;
    match tag {
        TAG_GAMEPAD_STATE => {
            const NEED: usize = 13;
            if rest.len() < NEED {
                return Err(WireError::Truncated {
                    kind: "gamepad",
                    need: NEED,
                    got: rest.len(),
                });
            }
            Ok(InputWireEvent::Gamepad(GamepadState {
                slot: rest[0],
                buttons: u16_le(rest, 1),
                left_trigger: rest[3],
                right_trigger: rest[4],
                left_x: i16_le(rest, 5),
                left_y: i16_le(rest, 7),
                right_x: i16_le(rest, 9),
                right_y: i16_le(rest, 11),
            }))
        }
        TAG_KEYBOARD => {
            const NEED: usize = 4;
            if rest.len() < NEED {
                return Err(WireError::Truncated {
                    kind: "keyboard",
                    need: NEED,
                    got: rest.len(),
                });
            }
            Ok(InputWireEvent::Keyboard(KeyboardEvent {
                virtual_key: u16_le(rest, 0),
                modifiers: rest[2],
                pressed: rest[3] != 0,
            }))
        }
        TAG_MOUSE_MOVE => {
            const NEED: usize = 5;
            if rest.len() < NEED {
                return Err(WireError::Truncated {
                    kind: "mouse_move",
                    need: NEED,
                    got: rest.len(),
                });
            }
            Ok(InputWireEvent::MouseMove(MouseMoveEvent {
                absolute: rest[0] & MOUSE_MOVE_FLAG_ABSOLUTE != 0,
                x: i16_le(rest, 1),
                y: i16_le(rest, 3),
            }))
        }
        TAG_MOUSE_BUTTON => {
            const NEED: usize = 2;
            if rest.len() < NEED {
                return Err(WireError::Truncated {
                    kind: "mouse_button",
                    need: NEED,
                    got: rest.len(),
                });
            }
            Ok(InputWireEvent::MouseButton(MouseButtonEvent {
                button: rest[0],
                pressed: rest[1] != 0,
            }))
        }
        TAG_MOUSE_SCROLL => {
            const NEED: usize = 5;
            if rest.len() < NEED {
                return Err(WireError::Truncated {
                    kind: "mouse_scroll",
                    need: NEED,
                    got: rest.len(),
                });
            }
            Ok(InputWireEvent::MouseScroll(MouseScrollEvent {
                dx: i16_le(rest, 1),
                dy: i16_le(rest, 3),
            }))
        }
        other => Err(WireError::UnknownTag(other)),
    }
}

/// Encode an input event back to its wire representation. Used by tests and
/// by any loopback/replay tooling exercising the data channel.
pub fn encode_input_event(event: &InputWireEvent) -> Vec<u8> {
    match event {
        InputWireEvent::Gamepad(g) => {
            let mut buf = Vec::with_capacity(14);
            buf.push(TAG_GAMEPAD_STATE);
            buf.push(g.slot);
            buf.extend_from_slice(&g.buttons.to_le_bytes());
            buf.push(g.left_trigger);
            buf.push(g.right_trigger);
            buf.extend_from_slice(&g.left_x.to_le_bytes());
            buf.extend_from_slice(&g.left_y.to_le_bytes());
            buf.extend_from_slice(&g.right_x.to_le_bytes());
            buf.extend_from_slice(&g.right_y.to_le_bytes());
            buf
        }
        InputWireEvent::Keyboard(k) => {
            let mut buf = Vec::with_capacity(5);
            buf.push(TAG_KEYBOARD);
            buf.extend_from_slice(&k.virtual_key.to_le_bytes());
            buf.push(k.modifiers);
            buf.push(k.pressed as u8);
            buf
        }
        InputWireEvent::MouseMove(m) => {
            let mut buf = Vec::with_capacity(6);
            buf.push(TAG_MOUSE_MOVE);
            buf.push(if m.absolute { MOUSE_MOVE_FLAG_ABSOLUTE } else { 0 });
            buf.extend_from_slice(&m.x.to_le_bytes());
            buf.extend_from_slice(&m.y.to_le_bytes());
            buf
        }
        InputWireEvent::MouseButton(b) => vec![TAG_MOUSE_BUTTON, b.button, b.pressed as u8],
        InputWireEvent::MouseScroll(s) => {
            let mut buf = Vec::with_capacity(6);
            buf.push(TAG_MOUSE_SCROLL);
            buf.push(0);
            buf.extend_from_slice(&s.dx.to_le_bytes());
            buf.extend_from_slice(&s.dy.to_le_bytes());
            buf
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamepad_roundtrip() {
        let event = InputWireEvent::Gamepad(GamepadState {
            slot: 2,
            buttons: 0x8001,
            left_trigger: 255,
            right_trigger: 0,
            left_x: -32768,
            left_y: 32767,
            right_x: 0,
            right_y: -1,
        });
        let buf = encode_input_event(&event);
        assert_eq!(buf.len(), 14);
        assert_eq!(parse_input_event(&buf).unwrap(), event);
    }

    #[test]
    fn keyboard_roundtrip() {
        let event = InputWireEvent::Keyboard(KeyboardEvent {
            virtual_key: 0x41,
            modifiers: 0b0000_0101,
            pressed: true,
        });
        let buf = encode_input_event(&event);
        assert_eq!(parse_input_event(&buf).unwrap(), event);
    }

    #[test]
    fn mouse_move_relative_vs_absolute() {
        let relative = InputWireEvent::MouseMove(MouseMoveEvent {
            absolute: false,
            x: -5,
            y: 10,
        });
        let absolute = InputWireEvent::MouseMove(MouseMoveEvent {
            absolute: true,
            x: 960,
            y: 540,
        });
        assert_eq!(parse_input_event(&encode_input_event(&relative)).unwrap(), relative);
        assert_eq!(parse_input_event(&encode_input_event(&absolute)).unwrap(), absolute);
    }

    #[test]
    fn mouse_button_and_scroll_roundtrip() {
        let button = InputWireEvent::MouseButton(MouseButtonEvent {
            button: 1,
            pressed: false,
        });
        let scroll = InputWireEvent::MouseScroll(MouseScrollEvent { dx: 0, dy: -120 });
        assert_eq!(parse_input_event(&encode_input_event(&button)).unwrap(), button);
        assert_eq!(parse_input_event(&encode_input_event(&scroll)).unwrap(), scroll);
    }

    #[test]
    fn empty_buffer_is_an_error() {
        assert_eq!(parse_input_event(&[]).unwrap_err(), WireError::Empty);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert_eq!(parse_input_event(&[0xff]).unwrap_err(), WireError::UnknownTag(0xff));
    }

    #[test]
    fn truncated_gamepad_payload_is_an_error() {
        let buf = [TAG_GAMEPAD_STATE, 0, 0, 0];
        match parse_input_event(&buf) {
            Err(WireError::Truncated { kind: "gamepad", need: 13, got: 3 }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }
}
