//! The WebSocket signaling endpoint: JSON message dispatch, SDP/ICE
//! exchange, and the room lifecycle (join, promote, gamepad claims,
//! permission grants, quality changes, leave/teardown).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;
use webrtc::api::API;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;

use streamcore_protocol::{ErrorCode, SdpType, SignalingMessage};

use crate::collaborators::VideoCodec;
use crate::input::InputRouter;
use crate::media_sender::{MediaSender, now_ms};
use crate::peer::{IceServerConfig, PeerState, create_peer};
use crate::registry::PeerRegistry;
use crate::room::{Room, RoomError};

fn clamp_u32(value: u32, min: u32, max: u32) -> u32 {
    value.clamp(min, max)
}

struct QualityState {
    bitrate_kbps: u32,
    framerate: u32,
    width: u32,
    height: u32,
}

pub struct SignalingServer {
    room: Arc<Room>,
    registry: Arc<PeerRegistry>,
    media_sender: Arc<MediaSender>,
    input_router: Arc<InputRouter>,
    api: Arc<API>,
    ice_servers: Vec<IceServerConfig>,
    video_codec: VideoCodec,
    connections: RwLock<std::collections::HashMap<Uuid, mpsc::UnboundedSender<SignalingMessage>>>,
    quality: std::sync::Mutex<QualityState>,
    accepting: AtomicBool,
}

impl SignalingServer {
    pub fn new(
        room: Arc<Room>,
        registry: Arc<PeerRegistry>,
        media_sender: Arc<MediaSender>,
        input_router: Arc<InputRouter>,
        api: Arc<API>,
        ice_servers: Vec<IceServerConfig>,
        video_codec: VideoCodec,
        initial_quality: (u32, u32, u32, u32),
    ) -> Self {
        Self {
            room,
            registry,
            media_sender,
            input_router,
            api,
            ice_servers,
            video_codec,
            connections: RwLock::new(std::collections::HashMap::new()),
            quality: std::sync::Mutex::new(QualityState {
                bitrate_kbps: initial_quality.0,
                framerate: initial_quality.1,
                width: initial_quality.2,
                height: initial_quality.3,
            }),
            accepting: AtomicBool::new(true),
        }
    }

    /// Stops accepting new WebSocket upgrades; existing sessions keep running
    /// until `close_all_for_shutdown`.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub async fn close_all_for_shutdown(&self) {
        self.media_sender.stop().await;
        self.registry.close_all().await;
    }

    async fn send_to(&self, peer_id: Uuid, msg: SignalingMessage) {
        let tx = self.connections.read().await.get(&peer_id).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(msg);
        }
    }

    async fn broadcast_except(&self, exclude: Option<Uuid>, msg: SignalingMessage) {
        let senders: Vec<_> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(msg.clone());
        }
    }

    async fn broadcast_all(&self, msg: SignalingMessage) {
        self.broadcast_except(None, msg).await;
    }

    async fn handle_join(self: &Arc<Self>, tx: &mpsc::UnboundedSender<SignalingMessage>, player_name: String) -> Option<Uuid> {
        let id = Uuid::new_v4();
        let is_host = self.room.host_id().is_none();
        let join_result = if is_host {
            self.room.add_host(id, player_name)
        } else {
            self.room.add_spectator(id, player_name)
        };
        if let Err(RoomError::RoomFull) = join_result {
            let _ = tx.send(SignalingMessage::Error {
                message: "room is full".to_string(),
                code: ErrorCode::RoomFull,
            });
            return None;
        }

        self.connections.write().await.insert(id, tx.clone());
        self.media_sender.start().await;

        let server = Arc::clone(self);
        let peer = match create_peer(id, &self.api, &self.ice_servers, move |peer_id, state| {
            let server = server.clone();
            tokio::spawn(async move { server.on_peer_state_change(peer_id, state).await });
        })
        .await
        {
            Ok(peer) => peer,
            Err(e) => {
                warn!(%id, error = %e, "failed to create peer connection");
                self.room.remove_peer(id);
                self.connections.write().await.remove(&id);
                let _ = tx.send(SignalingMessage::Error {
                    message: "internal error creating peer".to_string(),
                    code: ErrorCode::Internal,
                });
                return None;
            }
        };

        let media_sender_for_rtcp = Arc::clone(&self.media_sender);
        if let Err(e) = peer
            .add_video_track(self.video_codec, move || {
                media_sender_for_rtcp.request_idr(now_ms());
            })
            .await
        {
            warn!(%id, error = %e, "failed to add video track");
        }
        if let Err(e) = peer.add_audio_track().await {
            warn!(%id, error = %e, "failed to add audio track");
        }
        match peer.create_data_channel("input").await {
            Ok(channel) => self.wire_input_channel(id, &channel),
            Err(e) => warn!(%id, error = %e, "failed to create input data channel"),
        }

        self.registry.insert(peer.clone()).await;

        let offer = match peer.create_description(true).await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(%id, error = %e, "failed to create SDP offer");
                return Some(id);
            }
        };
        let _ = tx.send(SignalingMessage::Sdp {
            sdp: offer,
            sdp_type: SdpType::Offer,
        });

        let players = self.room.players();
        let (keyboard_enabled, mouse_enabled, host, spectator, slot) =
            self.room.peer_state(id).unwrap_or((false, false, false, true, None));
        let roster_msg = if is_host {
            SignalingMessage::RoomCreated {
                room_code: crate::room::ROOM_CODE.to_string(),
                peer_id: id,
                player_slot: slot,
                is_host: host,
                is_spectator: spectator,
                keyboard_enabled,
                mouse_enabled,
                players: players.clone(),
            }
        } else {
            SignalingMessage::RoomJoined {
                room_code: crate::room::ROOM_CODE.to_string(),
                peer_id: id,
                player_slot: slot,
                is_host: host,
                is_spectator: spectator,
                keyboard_enabled,
                mouse_enabled,
                players: players.clone(),
            }
        };
        let _ = tx.send(roster_msg);

        if let Some(summary) = self.room.player_summary(id) {
            self.broadcast_except(Some(id), SignalingMessage::PlayerJoined { player: summary }).await;
        }
        self.broadcast_except(Some(id), SignalingMessage::RoomUpdated { players }).await;

        Some(id)
    }

    fn wire_input_channel(self: &Arc<Self>, peer_id: Uuid, channel: &Arc<RTCDataChannel>) {
        let input_router = self.input_router.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let input_router = input_router.clone();
            Box::pin(async move {
                if let Err(e) = input_router.handle_frame(peer_id, &msg.data) {
                    warn!(%peer_id, error = %e, "dropping malformed input frame");
                }
            })
        }));
    }

    async fn on_peer_state_change(self: Arc<Self>, peer_id: Uuid, state: PeerState) {
        match state {
            PeerState::Connected => {
                self.send_to(peer_id, SignalingMessage::StreamReady).await;
                // New peer has no decoder state yet; kick the encoder for a
                // keyframe so it doesn't wait out a full GOP before it can decode.
                self.media_sender.request_idr(now_ms());
            }
            PeerState::Failed => {
                info!(%peer_id, "peer connection failed, tearing down");
                self.handle_disconnect(peer_id).await;
            }
            _ => {}
        }
    }

    async fn handle_leave(self: &Arc<Self>, peer_id: Uuid) {
        self.send_to(peer_id, SignalingMessage::LeftRoom).await;
        self.handle_disconnect(peer_id).await;
    }

    /// Ordering per the teardown contract: registry first (close the
    /// transport outside any lock), then room state, then the connection map.
    async fn handle_disconnect(self: &Arc<Self>, peer_id: Uuid) {
        let peer = self.registry.remove(peer_id).await;
        let was_host = self.room.remove_peer(peer_id);
        self.connections.write().await.remove(&peer_id);
        if let Some(peer) = peer {
            peer.close().await;
        }

        if was_host {
            self.broadcast_except(
                Some(peer_id),
                SignalingMessage::RoomClosed {
                    reason: "host left".to_string(),
                },
            )
            .await;
            self.registry.close_all().await;
            self.room.clear();
            self.connections.write().await.clear();
        } else {
            self.broadcast_all(SignalingMessage::PlayerLeft { peer_id }).await;
            self.broadcast_all(SignalingMessage::RoomUpdated { players: self.room.players() }).await;
        }

        if self.room.is_empty() {
            self.media_sender.stop().await;
        }
    }

    async fn handle_message(self: &Arc<Self>, peer_id: Uuid, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Join { .. } | SignalingMessage::Leave => {
                // Join is handled before a peer_id exists; Leave is routed
                // from the read loop directly so it can clear the loop's
                // local state too.
            }
            SignalingMessage::JoinAsPlayer => match self.room.promote_to_player(peer_id) {
                Ok(slot) => {
                    let (keyboard_enabled, mouse_enabled, ..) =
                        self.room.peer_state(peer_id).unwrap_or((false, false, false, false, None));
                    self.send_to(
                        peer_id,
                        SignalingMessage::PromotedToPlayer { player_slot: slot, keyboard_enabled, mouse_enabled },
                    )
                    .await;
                    self.broadcast_all(SignalingMessage::RoomUpdated { players: self.room.players() }).await;
                    self.media_sender.request_idr(now_ms());
                }
                Err(_) => {
                    self.send_to(
                        peer_id,
                        SignalingMessage::Error { message: "no player slots available".to_string(), code: ErrorCode::InvalidState },
                    )
                    .await;
                }
            },
            SignalingMessage::ClaimGamepad { gamepad_id } => match self.room.claim_gamepad(peer_id, gamepad_id) {
                Ok(server_slot) => {
                    self.broadcast_all(SignalingMessage::GamepadClaimed { peer_id, server_slot }).await;
                }
                Err(_) => {
                    self.send_to(
                        peer_id,
                        SignalingMessage::Error { message: "only players can claim gamepads".to_string(), code: ErrorCode::NotPlayer },
                    )
                    .await;
                }
            },
            SignalingMessage::ReleaseGamepad { server_slot } => {
                self.room.release_gamepad(peer_id, server_slot);
                self.broadcast_all(SignalingMessage::GamepadReleased { server_slot }).await;
            }
            SignalingMessage::Sdp { sdp, sdp_type } => {
                let Some(peer) = self.registry.find(peer_id).await else { return };
                match sdp_type {
                    SdpType::Answer => {
                        if let Err(e) = peer.set_remote_description(&sdp, false).await {
                            warn!(%peer_id, error = %e, "rejecting malformed SDP answer");
                            self.send_to(
                                peer_id,
                                SignalingMessage::Error { message: "malformed SDP".to_string(), code: ErrorCode::InvalidSdp },
                            )
                            .await;
                        }
                    }
                    SdpType::Offer => {
                        if peer.set_remote_description(&sdp, true).await.is_ok() {
                            if let Ok(answer) = peer.create_description(false).await {
                                self.send_to(peer_id, SignalingMessage::Sdp { sdp: answer, sdp_type: SdpType::Answer }).await;
                            }
                        } else {
                            self.send_to(
                                peer_id,
                                SignalingMessage::Error { message: "malformed SDP".to_string(), code: ErrorCode::InvalidSdp },
                            )
                            .await;
                        }
                    }
                }
            }
            SignalingMessage::Ice { candidate, mid } => {
                if let Some(peer) = self.registry.find(peer_id).await
                    && let Err(e) = peer.add_ice_candidate(candidate, mid).await
                {
                    warn!(%peer_id, error = %e, "dropping bad ICE candidate");
                }
            }
            SignalingMessage::SetGuestKeyboard { peer_id: target, enabled } => {
                if !self.room.is_host(peer_id) {
                    self.send_to(peer_id, SignalingMessage::Error { message: "only the host can do that".to_string(), code: ErrorCode::NotHost }).await;
                    return;
                }
                if self.room.set_keyboard_access(target, enabled).is_ok() {
                    self.room.set_default_guest_keyboard(enabled);
                    self.send_to(target, SignalingMessage::PermissionChanged { keyboard_enabled: Some(enabled), mouse_enabled: None }).await;
                    self.broadcast_all(SignalingMessage::RoomUpdated { players: self.room.players() }).await;
                }
            }
            SignalingMessage::SetGuestMouse { peer_id: target, enabled } => {
                if !self.room.is_host(peer_id) {
                    self.send_to(peer_id, SignalingMessage::Error { message: "only the host can do that".to_string(), code: ErrorCode::NotHost }).await;
                    return;
                }
                if self.room.set_mouse_access(target, enabled).is_ok() {
                    self.room.set_default_guest_mouse(enabled);
                    self.send_to(target, SignalingMessage::PermissionChanged { keyboard_enabled: None, mouse_enabled: Some(enabled) }).await;
                    self.broadcast_all(SignalingMessage::RoomUpdated { players: self.room.players() }).await;
                }
            }
            SignalingMessage::SetQuality { bitrate_kbps, framerate, width, height } => {
                if !self.room.is_host(peer_id) {
                    self.send_to(peer_id, SignalingMessage::Error { message: "only the host can do that".to_string(), code: ErrorCode::NotHost }).await;
                    return;
                }
                let clamped = {
                    let mut quality = self.quality.lock().unwrap_or_else(|e| e.into_inner());
                    quality.bitrate_kbps = clamp_u32(bitrate_kbps, 1000, 150_000);
                    quality.framerate = clamp_u32(framerate, 30, 240);
                    quality.width = clamp_u32(width, 640, 7680);
                    quality.height = clamp_u32(height, 480, 4320);
                    (quality.bitrate_kbps, quality.framerate, quality.width, quality.height)
                };
                self.media_sender
                    .set_quality(clamped.0, clamped.1, clamped.2, clamped.3);
                self.broadcast_all(SignalingMessage::QualityUpdated {
                    bitrate_kbps: clamped.0,
                    framerate: clamped.1,
                    width: clamped.2,
                    height: clamped.3,
                })
                .await;
            }
            // Server -> client variants never arrive from a client.
            _ => {}
        }
    }
}

pub async fn handle_socket(server: Arc<SignalingServer>, socket: WebSocket) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else { continue };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut peer_id: Option<Uuid> = None;
    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<SignalingMessage>(&text) else {
                    continue;
                };
                match (parsed, peer_id) {
                    (SignalingMessage::Join { player_name }, None) => {
                        if !server.is_accepting() {
                            let _ = tx.send(SignalingMessage::Error {
                                message: "server is shutting down".to_string(),
                                code: ErrorCode::Internal,
                            });
                            continue;
                        }
                        peer_id = server.handle_join(&tx, player_name).await;
                    }
                    (SignalingMessage::Leave, Some(id)) => {
                        server.handle_leave(id).await;
                        peer_id = None;
                    }
                    (other, Some(id)) => server.handle_message(id, other).await,
                    (_, None) => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(id) = peer_id {
        server.handle_disconnect(id).await;
    }
    forward_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_bitrate_respects_bounds() {
        assert_eq!(clamp_u32(500, 1000, 150_000), 1000);
        assert_eq!(clamp_u32(999_999, 1000, 150_000), 150_000);
        assert_eq!(clamp_u32(5000, 1000, 150_000), 5000);
    }
}
