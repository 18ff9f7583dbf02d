//! Pulls encoded frames from the video/audio encoder queues, packetizes
//! them once, and fans the resulting RTP packets out through the registry.
//! Runs only while at least one peer is connected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::collaborators::{AudioEncoderQueue, CaptureControl, VideoEncoderQueue};
use crate::registry::PeerRegistry;
use crate::rtp::RtpPacketizer;

const IDR_REQUEST_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Current time in milliseconds since the Unix epoch, for throttling
/// IDR-request bursts. Not monotonic across clock adjustments, but the
/// throttle window only cares about elapsed wall-clock time at second
/// granularity.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct MediaSender {
    registry: Arc<PeerRegistry>,
    packetizer: Arc<RtpPacketizer>,
    video_queue: Arc<dyn VideoEncoderQueue>,
    audio_queue: Arc<dyn AudioEncoderQueue>,
    capture: Arc<dyn CaptureControl>,
    video_framerate_hint: Option<u32>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    last_idr_request_ms: AtomicI64,
    running: AtomicBool,
}

impl MediaSender {
    pub fn new(
        registry: Arc<PeerRegistry>,
        packetizer: Arc<RtpPacketizer>,
        video_queue: Arc<dyn VideoEncoderQueue>,
        audio_queue: Arc<dyn AudioEncoderQueue>,
        capture: Arc<dyn CaptureControl>,
        video_framerate_hint: Option<u32>,
    ) -> Self {
        Self {
            registry,
            packetizer,
            video_queue,
            audio_queue,
            capture,
            video_framerate_hint,
            tasks: Mutex::new(None),
            last_idr_request_ms: AtomicI64::new(i64::MIN),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Idempotent: a second call while already running is a no-op. Callers
    /// start this when the first peer joins (spec §4.4: capture lags the
    /// first connection, not process startup).
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.capture.start_video_capture();
        self.capture.start_audio_capture();

        let video_handle = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_video_loop().await })
        };
        let audio_handle = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_audio_loop().await })
        };
        *self.tasks.lock().await = Some((video_handle, audio_handle));
    }

    /// Called when the last peer leaves. Stops capture and aborts the
    /// pump tasks; safe to call even if never started.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.capture.stop_video_capture();
        self.capture.stop_audio_capture();
        if let Some((video_handle, audio_handle)) = self.tasks.lock().await.take() {
            video_handle.abort();
            audio_handle.abort();
        }
    }

    /// Throttled to at most one PLI-driven encoder kick per second so a
    /// storm of receiver reports can't pin the encoder in IDR mode.
    pub fn request_idr(&self, now_ms: i64) {
        let last = self.last_idr_request_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < IDR_REQUEST_MIN_INTERVAL.as_millis() as i64 {
            return;
        }
        if self
            .last_idr_request_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.capture.request_idr_frame();
        }
    }

    /// Forwards a host-requested quality change to the encoder collaborator.
    pub fn set_quality(&self, bitrate_kbps: u32, framerate: u32, width: u32, height: u32) {
        self.capture.set_quality(bitrate_kbps, framerate, width, height);
    }

    async fn run_video_loop(self: Arc<Self>) {
        let mut frame_index: u64 = 0;
        loop {
            let Some(frame) = self.video_queue.recv().await else {
                debug!("video encoder queue closed, stopping video pump");
                break;
            };
            if self.registry.connected_count().await == 0 {
                continue;
            }
            let timestamp = RtpPacketizer::video_timestamp(frame_index, self.video_framerate_hint);
            frame_index += 1;
            let packets = self
                .packetizer
                .packetize_video(&frame.data, timestamp, frame.is_idr);
            for packet in &packets {
                self.registry.broadcast_video(packet).await;
            }
        }
    }

    async fn run_audio_loop(self: Arc<Self>) {
        let mut packet_index: u64 = 0;
        loop {
            let Some(frame) = self.audio_queue.recv().await else {
                warn!("audio encoder queue closed, stopping audio pump");
                break;
            };
            if self.registry.connected_count().await == 0 {
                continue;
            }
            let timestamp = RtpPacketizer::audio_timestamp(packet_index);
            packet_index += 1;
            let packet = self.packetizer.packetize_audio(&frame.data, timestamp);
            self.registry.broadcast_audio(&packet).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{EncoderFrame, LoggingCaptureControl, VideoCodec};
    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    struct OnceVideoQueue {
        frame: AsyncMutex<Option<EncoderFrame>>,
        codec: VideoCodec,
    }

    #[async_trait]
    impl VideoEncoderQueue for OnceVideoQueue {
        async fn recv(&self) -> Option<EncoderFrame> {
            self.frame.lock().await.take()
        }

        fn codec(&self) -> VideoCodec {
            self.codec
        }
    }

    struct EmptyAudioQueue;

    #[async_trait]
    impl AudioEncoderQueue for EmptyAudioQueue {
        async fn recv(&self) -> Option<EncoderFrame> {
            None
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_and_drives_capture_once() {
        let capture = Arc::new(LoggingCaptureControl::new());
        let sender = Arc::new(MediaSender::new(
            Arc::new(PeerRegistry::new()),
            Arc::new(RtpPacketizer::new(VideoCodec::H264, 1, 2)),
            Arc::new(OnceVideoQueue {
                frame: AsyncMutex::new(None),
                codec: VideoCodec::H264,
            }),
            Arc::new(EmptyAudioQueue),
            capture.clone(),
            Some(30),
        ));
        sender.start().await;
        sender.start().await;
        assert_eq!(capture.video_starts.load(Ordering::Relaxed), 1);
        sender.stop().await;
        sender.stop().await;
        assert_eq!(capture.video_stops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn idr_request_is_throttled_to_once_per_second() {
        let capture = Arc::new(LoggingCaptureControl::new());
        let sender = MediaSender::new(
            Arc::new(PeerRegistry::new()),
            Arc::new(RtpPacketizer::new(VideoCodec::H264, 1, 2)),
            Arc::new(OnceVideoQueue {
                frame: AsyncMutex::new(None),
                codec: VideoCodec::H264,
            }),
            Arc::new(EmptyAudioQueue),
            capture.clone(),
            None,
        );
        sender.request_idr(1_000);
        sender.request_idr(1_200);
        sender.request_idr(2_500);
        assert_eq!(capture.idr_requests.load(Ordering::Relaxed), 2);
    }
}
