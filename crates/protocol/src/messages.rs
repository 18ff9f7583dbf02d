use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row of a room's player/spectator roster, as sent in `room_created`,
/// `room_joined`, and `room_updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSummary {
    pub peer_id: Uuid,
    pub name: String,
    /// `None` for spectators.
    pub slot: Option<u8>,
    pub is_host: bool,
    pub is_spectator: bool,
    pub can_use_keyboard: bool,
    pub can_use_mouse: bool,
    pub gamepad_count: u8,
}

/// Every JSON message exchanged over the signaling WebSocket, in both
/// directions. `type` disambiguates; most variants are only ever sent by one
/// side, but `sdp` and `ice` are exchanged by both as part of the same
/// offer/answer/candidate dance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    // ---- client -> server ----
    /// Create or join a room as host/spectator depending on room existence.
    Join { player_name: String },
    /// Leave the room the peer currently occupies.
    Leave,
    /// Ask to be promoted from spectator to an open player slot.
    JoinAsPlayer,
    /// Claim a gamepad slot for the sending peer.
    ClaimGamepad { gamepad_id: u8 },
    /// Release a previously claimed gamepad slot.
    ReleaseGamepad { server_slot: u8 },
    /// WebRTC SDP offer/answer.
    Sdp { sdp: String, sdp_type: SdpType },
    /// WebRTC ICE candidate.
    Ice {
        candidate: String,
        mid: Option<String>,
    },
    /// Host grants/revokes a guest's keyboard access.
    SetGuestKeyboard { peer_id: Uuid, enabled: bool },
    /// Host grants/revokes a guest's mouse access.
    SetGuestMouse { peer_id: Uuid, enabled: bool },
    /// Host requests a stream quality change; values are clamped server-side.
    SetQuality {
        bitrate_kbps: u32,
        framerate: u32,
        width: u32,
        height: u32,
    },

    // ---- server -> client ----
    /// Sent to the peer that just created a room (first joiner becomes host).
    RoomCreated {
        room_code: String,
        peer_id: Uuid,
        player_slot: Option<u8>,
        is_host: bool,
        is_spectator: bool,
        keyboard_enabled: bool,
        mouse_enabled: bool,
        players: Vec<PlayerSummary>,
    },
    /// Sent to a peer that joined an existing room.
    RoomJoined {
        room_code: String,
        peer_id: Uuid,
        player_slot: Option<u8>,
        is_host: bool,
        is_spectator: bool,
        keyboard_enabled: bool,
        mouse_enabled: bool,
        players: Vec<PlayerSummary>,
    },
    /// Roster changed; broadcast to every peer in the room.
    RoomUpdated { players: Vec<PlayerSummary> },
    /// A new peer joined; broadcast to existing peers.
    PlayerJoined { player: PlayerSummary },
    /// A peer left; broadcast to remaining peers.
    PlayerLeft { peer_id: Uuid },
    /// Sent to a spectator after a successful `join_as_player`.
    PromotedToPlayer {
        player_slot: u8,
        keyboard_enabled: bool,
        mouse_enabled: bool,
    },
    /// Sent once the peer's video/audio tracks are attached and flowing.
    StreamReady,
    /// Broadcast after a quality change is applied.
    QualityUpdated {
        bitrate_kbps: u32,
        framerate: u32,
        width: u32,
        height: u32,
    },
    /// Sent to a peer whose keyboard/mouse permission changed.
    PermissionChanged {
        keyboard_enabled: Option<bool>,
        mouse_enabled: Option<bool>,
    },
    /// Broadcast after a gamepad slot is claimed.
    GamepadClaimed { peer_id: Uuid, server_slot: u8 },
    /// Broadcast after a gamepad slot is released.
    GamepadReleased { server_slot: u8 },
    /// Sent to the host after they leave, just before the room is torn down.
    LeftRoom,
    /// Broadcast to remaining peers when the room closes (e.g. host left).
    RoomClosed { reason: String },
    /// A request could not be satisfied.
    Error { message: String, code: ErrorCode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Machine-matchable error categories, carried alongside the human-readable
/// `message` so clients can branch without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RoomFull,
    RoomNotFound,
    NotHost,
    NotPlayer,
    GamepadSlotTaken,
    GamepadSlotNotFound,
    InvalidSdp,
    InvalidState,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_round_trips() {
        let msg = SignalingMessage::Join {
            player_name: "zero".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"join","player_name":"zero"}"#);
        let back: SignalingMessage = serde_json::from_str(&json).unwrap();
        matches!(back, SignalingMessage::Join { .. });
    }

    #[test]
    fn sdp_tag_is_snake_case() {
        let msg = SignalingMessage::Sdp {
            sdp: "v=0".to_string(),
            sdp_type: SdpType::Offer,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"sdp""#));
        assert!(json.contains(r#""sdp_type":"offer""#));
    }

    #[test]
    fn room_created_contains_full_roster() {
        let peer_id = Uuid::nil();
        let msg = SignalingMessage::RoomCreated {
            room_code: "ABCD".to_string(),
            peer_id,
            player_slot: Some(0),
            is_host: true,
            is_spectator: false,
            keyboard_enabled: true,
            mouse_enabled: true,
            players: vec![PlayerSummary {
                peer_id,
                name: "host".to_string(),
                slot: Some(0),
                is_host: true,
                is_spectator: false,
                can_use_keyboard: true,
                can_use_mouse: true,
                gamepad_count: 0,
            }],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "room_created");
        assert_eq!(json["players"][0]["name"], "host");
    }

    #[test]
    fn error_carries_a_matchable_code() {
        let msg = SignalingMessage::Error {
            message: "room is full".to_string(),
            code: ErrorCode::RoomFull,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["code"], "room_full");
    }

    #[test]
    fn permission_changed_omits_none_entirely() {
        let msg = SignalingMessage::PermissionChanged {
            keyboard_enabled: Some(true),
            mouse_enabled: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["keyboard_enabled"], true);
        assert!(json["mouse_enabled"].is_null());
    }

    #[test]
    fn stream_ready_has_no_payload_fields() {
        let msg = SignalingMessage::StreamReady;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"stream_ready"}"#);
    }

    #[test]
    fn claim_and_release_gamepad_round_trip() {
        let claim = SignalingMessage::ClaimGamepad { gamepad_id: 1 };
        let json = serde_json::to_string(&claim).unwrap();
        let back: SignalingMessage = serde_json::from_str(&json).unwrap();
        match back {
            SignalingMessage::ClaimGamepad { gamepad_id } => assert_eq!(gamepad_id, 1),
            other => panic!("unexpected variant: {other:?}"),
        }

        let release = SignalingMessage::ReleaseGamepad { server_slot: 2 };
        let json = serde_json::to_string(&release).unwrap();
        let back: SignalingMessage = serde_json::from_str(&json).unwrap();
        match back {
            SignalingMessage::ReleaseGamepad { server_slot } => assert_eq!(server_slot, 2),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn ice_candidate_optional_mid_is_omitted_when_absent() {
        let msg = SignalingMessage::Ice {
            candidate: "candidate:1 1 UDP 2130706431 10.0.0.1 5000 typ host".to_string(),
            mid: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("mid").is_some());
        assert!(json["mid"].is_null());
    }
}
