use serde::{Deserialize, Serialize};

use crate::settings::Preferences;

/// Incoming video cap applied on mobile runtimes, in bits per second.
pub const MOBILE_MAX_SUBSCRIPTION_BITRATE: u64 = 2_500_000;

/// Voice-grade audio bitrate cap, in bits per second.
pub const MAX_AUDIO_BITRATE: u32 = 16_000;

/// Where the client runs. Mobile runtimes must release the camera when
/// the app is backgrounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeContext {
    #[default]
    Desktop,
    Mobile,
}

impl RuntimeContext {
    /// Classify a browser-style user agent string.
    pub fn from_user_agent(user_agent: &str) -> Self {
        if user_agent.contains("Mobile") {
            RuntimeContext::Mobile
        } else {
            RuntimeContext::Desktop
        }
    }

    pub fn is_mobile(self) -> bool {
        self == RuntimeContext::Mobile
    }
}

/// Camera capture constraints, reused verbatim when capture restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    #[serde(default)]
    pub device_id: Option<String>,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 24,
            device_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCodecPreference {
    pub codec: String,
    pub simulcast: bool,
}

/// Options handed to [`SessionConnector::connect`](crate::provider::SessionConnector::connect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub room_name: String,
    /// Cap on incoming video, in bits per second.
    pub max_subscription_bitrate: Option<u64>,
    pub max_audio_bitrate: Option<u32>,
    pub preferred_video_codecs: Vec<VideoCodecPreference>,
    pub audio_device_id: Option<String>,
    pub video: VideoConstraints,
}

/// Caller-side configuration for [`SessionClient::join_session`](crate::session::SessionClient::join_session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinConfig {
    pub room_name: String,
    #[serde(default)]
    pub runtime: RuntimeContext,
    #[serde(default)]
    pub audio_device_id: Option<String>,
    #[serde(default)]
    pub video: VideoConstraints,
}

impl JoinConfig {
    pub fn new(room_name: impl Into<String>, runtime: RuntimeContext) -> Self {
        Self {
            room_name: room_name.into(),
            runtime,
            audio_device_id: None,
            video: VideoConstraints::default(),
        }
    }

    /// Apply saved device choices. Mobile runtimes ignore them because
    /// another app may hold the device even when permission was granted.
    pub fn with_preferences(mut self, prefs: &Preferences) -> Self {
        if !self.runtime.is_mobile() {
            self.audio_device_id = prefs.audio_device_id.clone();
            self.video.device_id = prefs.video_device_id.clone();
        }
        self
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            room_name: self.room_name.clone(),
            max_subscription_bitrate: self
                .runtime
                .is_mobile()
                .then_some(MOBILE_MAX_SUBSCRIPTION_BITRATE),
            max_audio_bitrate: Some(MAX_AUDIO_BITRATE),
            preferred_video_codecs: vec![VideoCodecPreference {
                codec: "VP8".to_string(),
                simulcast: true,
            }],
            audio_device_id: self.audio_device_id.clone(),
            video: self.video.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_mobile_user_agents() {
        let iphone = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
        let desktop = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";
        assert_eq!(RuntimeContext::from_user_agent(iphone), RuntimeContext::Mobile);
        assert_eq!(RuntimeContext::from_user_agent(desktop), RuntimeContext::Desktop);
        assert_eq!(RuntimeContext::from_user_agent(""), RuntimeContext::Desktop);
    }

    #[test]
    fn desktop_options_have_no_subscription_cap() {
        let opts = JoinConfig::new("standup", RuntimeContext::Desktop).connect_options();
        assert_eq!(opts.room_name, "standup");
        assert_eq!(opts.max_subscription_bitrate, None);
        assert_eq!(opts.max_audio_bitrate, Some(16_000));
        assert_eq!(opts.preferred_video_codecs[0].codec, "VP8");
        assert_eq!(opts.video, VideoConstraints::default());
    }

    #[test]
    fn mobile_options_cap_incoming_video() {
        let opts = JoinConfig::new("standup", RuntimeContext::Mobile).connect_options();
        assert_eq!(
            opts.max_subscription_bitrate,
            Some(MOBILE_MAX_SUBSCRIPTION_BITRATE)
        );
    }

    #[test]
    fn saved_devices_only_apply_on_desktop() {
        let prefs = Preferences {
            audio_device_id: Some("mic-1".to_string()),
            video_device_id: Some("cam-1".to_string()),
            ..Default::default()
        };

        let desktop = JoinConfig::new("r", RuntimeContext::Desktop).with_preferences(&prefs);
        assert_eq!(desktop.audio_device_id.as_deref(), Some("mic-1"));
        assert_eq!(desktop.video.device_id.as_deref(), Some("cam-1"));

        let mobile = JoinConfig::new("r", RuntimeContext::Mobile).with_preferences(&prefs);
        assert_eq!(mobile.audio_device_id, None);
        assert_eq!(mobile.video.device_id, None);
    }

    #[test]
    fn join_config_deserializes_with_defaults() {
        let cfg: JoinConfig = serde_json::from_str(r#"{"room_name":"daily"}"#).unwrap();
        assert_eq!(cfg.runtime, RuntimeContext::Desktop);
        assert_eq!(cfg.video.frame_rate, 24);
    }
}
