//! External collaborators named in the system overview: the video/audio
//! encoders, the platform input sink, and capture control. Only their
//! interfaces are in scope here — concrete backends (a GStreamer pipeline,
//! a uinput device, a compositor capture API) are wired in by the deployment
//! that embeds this crate.

use async_trait::async_trait;

/// Codec carried by the video encoder for the lifetime of a session; constant
/// once chosen, per spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Hevc,
    Av1,
}

/// One encoded frame pulled off the encoder's output queue. Read-only from
/// the core's perspective.
#[derive(Debug, Clone)]
pub struct EncoderFrame {
    pub data: Vec<u8>,
    pub is_idr: bool,
    pub frame_index: u64,
}

impl EncoderFrame {
    pub fn new(data: Vec<u8>, is_idr: bool, frame_index: u64) -> Self {
        Self {
            data,
            is_idr,
            frame_index,
        }
    }
}

/// Source of encoded video frames. `recv` blocks (with the caller's own
/// timeout) until a frame is available or the encoder shuts down.
#[async_trait]
pub trait VideoEncoderQueue: Send + Sync {
    async fn recv(&self) -> Option<EncoderFrame>;
    fn codec(&self) -> VideoCodec;
}

/// Source of encoded Opus audio frames (48 kHz stereo, 10ms per packet).
#[async_trait]
pub trait AudioEncoderQueue: Send + Sync {
    async fn recv(&self) -> Option<EncoderFrame>;
}

/// Platform input sink: consumes semantic input events dispatched by
/// `InputRouter` after permission checks.
pub trait InputSink: Send + Sync {
    fn keyboard(&self, key_code: u16, pressed: bool);
    fn mouse_move_abs(&self, x: u16, y: u16);
    fn mouse_move_rel(&self, dx: i16, dy: i16);
    fn mouse_button(&self, button: u8, pressed: bool);
    fn mouse_scroll(&self, delta: i16, horizontal: bool);
    fn gamepad(&self, server_slot: u8, buttons: u16, lt: u8, rt: u8, sticks: [i16; 4]);
}

/// Capture lifecycle, started/stopped by `MediaSender` as peers come and go.
pub trait CaptureControl: Send + Sync {
    fn start_video_capture(&self);
    fn stop_video_capture(&self);
    fn start_audio_capture(&self);
    fn stop_audio_capture(&self);
    fn request_idr_frame(&self);
    /// Forward a host-requested quality change to the encoder. Values are
    /// already clamped to the server's accepted ranges by the caller.
    fn set_quality(&self, bitrate_kbps: u32, framerate: u32, width: u32, height: u32);
}

/// In-memory input sink that records calls. Used by the signaling/input test
/// suites in place of a real uinput/XTEST backend.
#[derive(Default)]
pub struct RecordingInputSink {
    pub events: std::sync::Mutex<Vec<RecordedInputEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedInputEvent {
    Keyboard { key_code: u16, pressed: bool },
    MouseMoveAbs { x: u16, y: u16 },
    MouseMoveRel { dx: i16, dy: i16 },
    MouseButton { button: u8, pressed: bool },
    MouseScroll { delta: i16, horizontal: bool },
    Gamepad {
        server_slot: u8,
        buttons: u16,
        lt: u8,
        rt: u8,
        sticks: [i16; 4],
    },
}

impl RecordingInputSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<RecordedInputEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl InputSink for RecordingInputSink {
    fn keyboard(&self, key_code: u16, pressed: bool) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedInputEvent::Keyboard { key_code, pressed });
    }

    fn mouse_move_abs(&self, x: u16, y: u16) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedInputEvent::MouseMoveAbs { x, y });
    }

    fn mouse_move_rel(&self, dx: i16, dy: i16) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedInputEvent::MouseMoveRel { dx, dy });
    }

    fn mouse_button(&self, button: u8, pressed: bool) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedInputEvent::MouseButton { button, pressed });
    }

    fn mouse_scroll(&self, delta: i16, horizontal: bool) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedInputEvent::MouseScroll { delta, horizontal });
    }

    fn gamepad(&self, server_slot: u8, buttons: u16, lt: u8, rt: u8, sticks: [i16; 4]) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedInputEvent::Gamepad {
                server_slot,
                buttons,
                lt,
                rt,
                sticks,
            });
    }
}

/// No-op capture control that logs transitions. Used where no real capture
/// pipeline is wired in (tests, and standalone signaling-only deployments).
#[derive(Default)]
pub struct LoggingCaptureControl {
    pub video_starts: std::sync::atomic::AtomicU64,
    pub video_stops: std::sync::atomic::AtomicU64,
    pub audio_starts: std::sync::atomic::AtomicU64,
    pub audio_stops: std::sync::atomic::AtomicU64,
    pub idr_requests: std::sync::atomic::AtomicU64,
    pub quality_updates: std::sync::atomic::AtomicU64,
}

impl LoggingCaptureControl {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureControl for LoggingCaptureControl {
    fn start_video_capture(&self) {
        self.video_starts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!("capture: start_video_capture");
    }

    fn stop_video_capture(&self) {
        self.video_stops
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!("capture: stop_video_capture");
    }

    fn start_audio_capture(&self) {
        self.audio_starts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!("capture: start_audio_capture");
    }

    fn stop_audio_capture(&self) {
        self.audio_stops
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!("capture: stop_audio_capture");
    }

    fn request_idr_frame(&self) {
        self.idr_requests
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::debug!("capture: request_idr_frame");
    }

    fn set_quality(&self, bitrate_kbps: u32, framerate: u32, width: u32, height: u32) {
        self.quality_updates
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(bitrate_kbps, framerate, width, height, "capture: set_quality");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_input_sink_records_in_order() {
        let sink = RecordingInputSink::new();
        sink.keyboard(0x41, true);
        sink.mouse_move_abs(100, 200);
        sink.keyboard(0x41, false);
        let events = sink.recorded();
        assert_eq!(
            events,
            vec![
                RecordedInputEvent::Keyboard {
                    key_code: 0x41,
                    pressed: true
                },
                RecordedInputEvent::MouseMoveAbs { x: 100, y: 200 },
                RecordedInputEvent::Keyboard {
                    key_code: 0x41,
                    pressed: false
                },
            ]
        );
    }

    #[test]
    fn logging_capture_control_counts_transitions() {
        let capture = LoggingCaptureControl::new();
        capture.start_video_capture();
        capture.start_audio_capture();
        capture.request_idr_frame();
        capture.set_quality(20000, 60, 1920, 1080);
        capture.stop_video_capture();
        capture.stop_audio_capture();
        assert_eq!(capture.video_starts.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(capture.audio_starts.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(capture.idr_requests.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(capture.quality_updates.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(capture.video_stops.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(capture.audio_stops.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
