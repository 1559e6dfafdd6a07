//! Frame and audio pipelines behind `MediaTrack::attach`.
//!
//! Each (track, surface) pair gets its own task. Video frames are converted
//! to I420 and handed to whatever [`FrameSink`] the host registered for the
//! surface; remote audio is decoded into the shared [`PlayoutBuffer`] mixer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::StreamExt;
use huddle_core::SurfaceId;
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use livekit::webrtc::prelude::{BoxVideoFrame, RtcAudioTrack, RtcVideoTrack};
use livekit::webrtc::video_stream::native::NativeVideoStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audio_playout::PlayoutBuffer;

/// A decoded video frame in I420 layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Frame {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub stride_y: u32,
    pub stride_u: u32,
    pub stride_v: u32,
}

impl I420Frame {
    fn from_video_frame(frame: &BoxVideoFrame) -> Self {
        let i420 = frame.buffer.to_i420();
        let (y, u, v) = i420.data();
        let (stride_y, stride_u, stride_v) = i420.strides();
        Self {
            width: frame.buffer.width(),
            height: frame.buffer.height(),
            y: y.to_vec(),
            u: u.to_vec(),
            v: v.to_vec(),
            stride_y,
            stride_u,
            stride_v,
        }
    }
}

/// Host-side consumer of frames for one surface.
///
/// Called from runtime worker threads; implementations hand the frame to
/// their UI thread themselves.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, track_sid: &str, frame: &I420Frame);
}

/// Render loop handle. Cancelled through `cancel_tx` on stop.
struct RenderLoop {
    cancel_tx: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

impl RenderLoop {
    fn cancel(self) {
        // The loop may already have exited on its own.
        let _ = self.cancel_tx.send(true);
    }
}

struct RendererInner {
    runtime: Handle,
    sinks: RwLock<HashMap<SurfaceId, Arc<dyn FrameSink>>>,
    loops: Mutex<HashMap<(String, SurfaceId), RenderLoop>>,
    playout: Arc<PlayoutBuffer>,
    frame_interval: u64,
}

/// Shared by every track of a connector.
#[derive(Clone)]
pub struct MediaRenderer {
    inner: Arc<RendererInner>,
}

impl MediaRenderer {
    /// Render every frame, spawning loops on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self::with_frame_interval(runtime, 1)
    }

    /// Deliver only every `interval`-th frame, to save CPU on hosts that
    /// re-encode frames before display.
    pub fn with_frame_interval(runtime: Handle, interval: u64) -> Self {
        Self {
            inner: Arc::new(RendererInner {
                runtime,
                sinks: RwLock::new(HashMap::new()),
                loops: Mutex::new(HashMap::new()),
                playout: Arc::new(PlayoutBuffer::new()),
                frame_interval: interval.max(1),
            }),
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Decoded remote audio, pulled by the platform audio output.
    pub fn playout_buffer(&self) -> Arc<PlayoutBuffer> {
        self.inner.playout.clone()
    }

    pub fn register_sink(&self, surface: SurfaceId, sink: Arc<dyn FrameSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(surface, sink);
    }

    pub fn unregister_sink(&self, surface: SurfaceId) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&surface);
    }

    pub fn has_sink(&self, surface: SurfaceId) -> bool {
        self.inner
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&surface)
    }

    pub fn active_loops(&self) -> usize {
        self.loops().len()
    }

    pub(crate) fn start_video(&self, track_sid: String, track: RtcVideoTrack, surface: SurfaceId) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = self.inner.runtime.spawn(frame_loop(
            track_sid.clone(),
            track,
            surface,
            self.inner.clone(),
            cancel_rx,
        ));
        self.insert(track_sid, surface, RenderLoop { cancel_tx, _handle: handle });
    }

    pub(crate) fn start_audio(&self, track_sid: String, track: RtcAudioTrack, surface: SurfaceId) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = self.inner.runtime.spawn(playout_loop(
            track_sid.clone(),
            track,
            self.inner.playout.clone(),
            cancel_rx,
        ));
        self.insert(track_sid, surface, RenderLoop { cancel_tx, _handle: handle });
    }

    /// Stop the loop for one (track, surface) pair. No-op if none runs.
    pub(crate) fn stop(&self, track_sid: &str, surface: SurfaceId) {
        if let Some(render_loop) = self.loops().remove(&(track_sid.to_string(), surface)) {
            render_loop.cancel();
        }
    }

    /// Stop every loop fed by `track_sid`.
    pub(crate) fn stop_track(&self, track_sid: &str) {
        let mut loops = self.loops();
        let keys: Vec<_> = loops.keys().filter(|(sid, _)| sid == track_sid).cloned().collect();
        for key in keys {
            if let Some(render_loop) = loops.remove(&key) {
                render_loop.cancel();
            }
        }
    }

    pub fn stop_all(&self) {
        for (_, render_loop) in self.loops().drain() {
            render_loop.cancel();
        }
        self.inner.playout.clear();
    }

    fn insert(&self, track_sid: String, surface: SurfaceId, render_loop: RenderLoop) {
        if let Some(previous) = self.loops().insert((track_sid, surface), render_loop) {
            previous.cancel();
        }
    }

    fn loops(&self) -> std::sync::MutexGuard<'_, HashMap<(String, SurfaceId), RenderLoop>> {
        self.inner.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RendererInner {
    fn sink(&self, surface: SurfaceId) -> Option<Arc<dyn FrameSink>> {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&surface)
            .cloned()
    }
}

fn should_render(frame_index: u64, interval: u64) -> bool {
    frame_index % interval == 0
}

async fn frame_loop(
    track_sid: String,
    track: RtcVideoTrack,
    surface: SurfaceId,
    renderer: Arc<RendererInner>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    tracing::info!(track_sid = %track_sid, ?surface, "frame_loop started");
    let mut stream = NativeVideoStream::new(track);
    let mut frame_count: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel_rx.changed() => {
                tracing::debug!(track_sid = %track_sid, ?surface, "frame_loop cancelled");
                break;
            }
            frame = stream.next() => {
                let Some(frame) = frame else {
                    tracing::info!(track_sid = %track_sid, "video stream ended");
                    break;
                };
                if frame_count == 0 {
                    tracing::info!(
                        track_sid = %track_sid,
                        width = frame.buffer.width(),
                        height = frame.buffer.height(),
                        "first video frame received"
                    );
                }
                let index = frame_count;
                frame_count += 1;
                if !should_render(index, renderer.frame_interval) {
                    continue;
                }
                // Frames arriving before the host registers a sink are dropped.
                if let Some(sink) = renderer.sink(surface) {
                    sink.on_frame(&track_sid, &I420Frame::from_video_frame(&frame));
                }
            }
        }
    }

    tracing::debug!(track_sid = %track_sid, frames = frame_count, "frame_loop exited");
}

async fn playout_loop(
    track_sid: String,
    track: RtcAudioTrack,
    playout: Arc<PlayoutBuffer>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    tracing::info!(track_sid = %track_sid, "audio playout started");
    let mut stream = NativeAudioStream::new(
        track,
        48_000, // sample rate
        1,      // mono
    );
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,
            frame = stream.next() => match frame {
                Some(frame) => playout.push_samples(&track_sid, &frame.data),
                None => break,
            },
        }
    }
    playout.remove_source(&track_sid);
    tracing::info!(track_sid = %track_sid, "audio playout ended");
}
