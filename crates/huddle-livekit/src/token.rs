use huddle_core::ProviderError;
use livekit_api::access_token::{AccessToken, VideoGrants};

/// Mint a room-join token locally from an API key pair.
///
/// For development servers only; production hosts get their tokens from
/// the token service.
pub fn mint_dev_token(
    api_key: &str,
    api_secret: &str,
    room: &str,
    identity: &str,
    name: Option<&str>,
) -> Result<String, ProviderError> {
    if api_key.is_empty() || api_secret.is_empty() {
        return Err(ProviderError::Other("missing LiveKit API key or secret".into()));
    }
    if identity.is_empty() || room.is_empty() {
        return Err(ProviderError::Other("token needs a room and an identity".into()));
    }

    let mut token = AccessToken::with_api_key(api_key, api_secret)
        .with_identity(identity)
        .with_grants(VideoGrants {
            room_join: true,
            room: room.to_string(),
            can_publish: true,
            can_subscribe: true,
            ..Default::default()
        });
    if let Some(name) = name {
        token = token.with_name(name);
    }

    token
        .to_jwt()
        .map_err(|e| ProviderError::Other(format!("token signing failed: {e}")))
}
