//! LiveKit provider for huddle-core.
//!
//! Implements the core's session seams on top of the LiveKit Rust SDK.
//! Video is delivered to the host as I420 frames through [`FrameSink`]s
//! registered per surface; remote audio lands in a [`PlayoutBuffer`] the
//! platform audio output drains.

mod audio_playout;
mod connector;
mod renderer;
mod token;
mod track;

pub use audio_playout::PlayoutBuffer;
pub use connector::{LiveKitConnector, LiveKitSession};
pub use renderer::{FrameSink, I420Frame, MediaRenderer};
pub use token::mint_dev_token;
pub use track::{CameraDevice, LiveKitTrack, MicrophoneDevice};

/// Bind the connector to the runtime the caller is running on.
pub fn connector_for_current_runtime() -> Result<LiveKitConnector, huddle_core::ProviderError> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| huddle_core::ProviderError::Other(format!("no tokio runtime: {e}")))?;
    Ok(LiveKitConnector::new(MediaRenderer::new(runtime)))
}
