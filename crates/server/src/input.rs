//! Decodes binary input-channel frames and dispatches them to an
//! `InputSink`, after the permission checks §4.8 requires: keyboard/mouse
//! gated on `Room`'s per-peer flags, gamepad slots auto-claimed on first use.

use uuid::Uuid;

use streamcore_protocol::wire::{InputWireEvent, WireError, parse_input_event};

use crate::collaborators::InputSink;
use crate::room::Room;

/// Browser `MouseEvent.button` values (0 left / 1 middle / 2 right) shifted
/// up by one so the sink's button space leaves 0 free as "no button".
fn remap_mouse_button(browser_button: u8) -> u8 {
    browser_button.saturating_add(1)
}

pub struct InputRouter {
    room: std::sync::Arc<Room>,
    sink: std::sync::Arc<dyn InputSink>,
}

impl InputRouter {
    pub fn new(room: std::sync::Arc<Room>, sink: std::sync::Arc<dyn InputSink>) -> Self {
        Self { room, sink }
    }

    /// Parses and dispatches one frame from a peer's "input" data channel.
    /// Malformed frames are dropped (logged by the caller); permission
    /// failures are silent drops, not errors, per §4.8.
    pub fn handle_frame(&self, peer_id: Uuid, frame: &[u8]) -> Result<(), WireError> {
        let event = parse_input_event(frame)?;
        match event {
            InputWireEvent::Gamepad(g) => {
                if self.room.player_slot(peer_id).is_none() {
                    return Ok(());
                }
                let server_slot = self.room.claim_gamepad(peer_id, g.slot).unwrap_or(g.slot);
                self.sink.gamepad(
                    server_slot,
                    g.buttons,
                    g.left_trigger,
                    g.right_trigger,
                    [g.left_x, g.left_y, g.right_x, g.right_y],
                );
            }
            InputWireEvent::Keyboard(k) => {
                if !self.room.can_use_keyboard(peer_id) {
                    return Ok(());
                }
                self.sink.keyboard(k.virtual_key, k.pressed);
            }
            InputWireEvent::MouseMove(m) => {
                if !self.room.can_use_mouse(peer_id) {
                    return Ok(());
                }
                if m.absolute {
                    self.sink.mouse_move_abs(m.x as u16, m.y as u16);
                } else {
                    self.sink.mouse_move_rel(m.x, m.y);
                }
            }
            InputWireEvent::MouseButton(b) => {
                if !self.room.can_use_mouse(peer_id) {
                    return Ok(());
                }
                self.sink.mouse_button(remap_mouse_button(b.button), b.pressed);
            }
            InputWireEvent::MouseScroll(s) => {
                if !self.room.can_use_mouse(peer_id) {
                    return Ok(());
                }
                if s.dy != 0 {
                    self.sink.mouse_scroll(s.dy, false);
                }
                if s.dx != 0 {
                    self.sink.mouse_scroll(s.dx, true);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{RecordedInputEvent, RecordingInputSink};
    use streamcore_protocol::wire::{
        GamepadState, KeyboardEvent, MouseButtonEvent, MouseMoveEvent, MouseScrollEvent, encode_input_event,
    };

    fn uid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn router() -> (InputRouter, std::sync::Arc<RecordingInputSink>, std::sync::Arc<Room>) {
        let room = std::sync::Arc::new(Room::new(4));
        let sink = std::sync::Arc::new(RecordingInputSink::new());
        let router = InputRouter::new(room.clone(), sink.clone());
        (router, sink, room)
    }

    #[test]
    fn keyboard_event_dropped_without_permission() {
        let (router, sink, room) = router();
        room.add_spectator(uid(1), "guest".into()).unwrap();
        let frame = encode_input_event(&InputWireEvent::Keyboard(KeyboardEvent {
            virtual_key: 0x41,
            modifiers: 0,
            pressed: true,
        }));
        router.handle_frame(uid(1), &frame).unwrap();
        assert!(sink.recorded().is_empty());
    }

    #[test]
    fn keyboard_event_dispatched_once_allowed() {
        let (router, sink, room) = router();
        room.add_host(uid(1), "host".into()).unwrap();
        let frame = encode_input_event(&InputWireEvent::Keyboard(KeyboardEvent {
            virtual_key: 0x41,
            modifiers: 0,
            pressed: true,
        }));
        router.handle_frame(uid(1), &frame).unwrap();
        assert_eq!(
            sink.recorded(),
            vec![RecordedInputEvent::Keyboard { key_code: 0x41, pressed: true }]
        );
    }

    #[test]
    fn mouse_move_routes_by_absolute_flag() {
        let (router, sink, room) = router();
        room.add_host(uid(1), "host".into()).unwrap();
        let relative = encode_input_event(&InputWireEvent::MouseMove(MouseMoveEvent {
            absolute: false,
            x: -3,
            y: 4,
        }));
        router.handle_frame(uid(1), &relative).unwrap();
        assert_eq!(sink.recorded(), vec![RecordedInputEvent::MouseMoveRel { dx: -3, dy: 4 }]);
    }

    #[test]
    fn mouse_button_is_remapped_up_by_one() {
        let (router, sink, room) = router();
        room.add_host(uid(1), "host".into()).unwrap();
        let frame = encode_input_event(&InputWireEvent::MouseButton(MouseButtonEvent {
            button: 0,
            pressed: true,
        }));
        router.handle_frame(uid(1), &frame).unwrap();
        assert_eq!(
            sink.recorded(),
            vec![RecordedInputEvent::MouseButton { button: 1, pressed: true }]
        );
    }

    #[test]
    fn gamepad_auto_claims_on_first_use() {
        let (router, sink, room) = router();
        room.add_host(uid(1), "host".into()).unwrap();
        let frame = encode_input_event(&InputWireEvent::Gamepad(GamepadState {
            slot: 0,
            buttons: 1,
            left_trigger: 0,
            right_trigger: 0,
            left_x: 0,
            left_y: 0,
            right_x: 0,
            right_y: 0,
        }));
        router.handle_frame(uid(1), &frame).unwrap();
        let events = sink.recorded();
        assert_eq!(events.len(), 1);
        match events[0] {
            RecordedInputEvent::Gamepad { server_slot, .. } => {
                assert_eq!(room.claim_gamepad(uid(1), 0).unwrap(), server_slot);
            }
            _ => panic!("expected Gamepad event"),
        }
    }

    #[test]
    fn spectator_gamepad_frame_is_dropped() {
        let (router, sink, room) = router();
        room.add_host(uid(1), "host".into()).unwrap();
        room.add_spectator(uid(2), "guest".into()).unwrap();
        let frame = encode_input_event(&InputWireEvent::Gamepad(GamepadState {
            slot: 0,
            buttons: 0,
            left_trigger: 0,
            right_trigger: 0,
            left_x: 0,
            left_y: 0,
            right_x: 0,
            right_y: 0,
        }));
        router.handle_frame(uid(2), &frame).unwrap();
        assert!(sink.recorded().is_empty());
    }

    #[test]
    fn scroll_splits_into_vertical_then_horizontal() {
        let (router, sink, room) = router();
        room.add_host(uid(1), "host".into()).unwrap();
        let frame = encode_input_event(&InputWireEvent::MouseScroll(MouseScrollEvent { dx: 5, dy: -10 }));
        router.handle_frame(uid(1), &frame).unwrap();
        assert_eq!(
            sink.recorded(),
            vec![
                RecordedInputEvent::MouseScroll { delta: -10, horizontal: false },
                RecordedInputEvent::MouseScroll { delta: 5, horizontal: true },
            ]
        );
    }

    #[test]
    fn malformed_frame_surfaces_wire_error() {
        let (router, _sink, room) = router();
        room.add_host(uid(1), "host".into()).unwrap();
        assert!(router.handle_frame(uid(1), &[]).is_err());
    }
}
