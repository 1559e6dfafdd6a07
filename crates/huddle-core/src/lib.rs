//! Huddle core: the participant view-state machine.
//!
//! Pure Rust, provider-agnostic. A session provider plugs in through the
//! traits in [`provider`]; UI shells drive a [`SessionClient`] and render
//! into surfaces they own.

pub mod auth;
pub mod bindings;
pub mod capture;
pub mod errors;
pub mod events;
pub mod options;
pub mod participants;
pub mod provider;
pub mod session;
pub mod settings;
pub mod speaker;

#[cfg(test)]
mod testing;

pub use auth::TokenService;
pub use capture::CaptureState;
pub use errors::{HuddleError, ProviderError};
pub use events::{ConnectionState, HuddleEvent, HuddleEventListener};
pub use options::{JoinConfig, RuntimeContext, VideoConstraints};
pub use provider::{Credentials, SessionConnector, SurfaceHost, SurfaceId};
pub use session::{SessionClient, SessionHandle};
pub use settings::{Preferences, PreferencesStore};

const DEFAULT_LOG_FILTER: &str = "huddle_core=debug,huddle_livekit=info";

/// Initialize tracing/logging. Call once from the host before joining.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init()
            .is_err()
        {
            tracing::debug!("a tracing subscriber is already installed");
        }
    });
}
