use url::Url;

use crate::errors::HuddleError;
use crate::provider::Credentials;

/// Fetches access tokens from the application's token endpoint.
///
/// The endpoint answers `GET <endpoint>?identity=<name>` with the raw token
/// as the response body.
pub struct TokenService;

impl TokenService {
    /// Request a token for `identity` and pair it with the media server URL.
    pub async fn request_credentials(
        token_endpoint: &str,
        server_url: &str,
        identity: &str,
    ) -> Result<Credentials, HuddleError> {
        let token = Self::request_token(token_endpoint, identity).await?;
        Ok(Credentials {
            url: Self::websocket_url(server_url)?,
            token,
        })
    }

    pub async fn request_token(token_endpoint: &str, identity: &str) -> Result<String, HuddleError> {
        let url = Self::token_url(token_endpoint, identity)?;

        tracing::info!("requesting token from {}", url);

        let resp = reqwest::get(url)
            .await
            .map_err(|e| HuddleError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(HuddleError::Auth(format!(
                "token endpoint returned status {}",
                resp.status()
            )));
        }

        let token = resp
            .text()
            .await
            .map_err(|e| HuddleError::Http(e.to_string()))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(HuddleError::Auth("token endpoint returned an empty token".into()));
        }
        Ok(token.to_string())
    }

    /// Build `<endpoint>?identity=<encoded identity>`.
    fn token_url(token_endpoint: &str, identity: &str) -> Result<Url, HuddleError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(HuddleError::Auth("identity must not be empty".into()));
        }

        let mut url = Url::parse(token_endpoint.trim())
            .map_err(|e| HuddleError::InvalidUrl(format!("{token_endpoint}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HuddleError::InvalidUrl(format!(
                "token endpoint must be http(s), got '{}'",
                url.scheme()
            )));
        }
        url.set_query(Some(&format!("identity={}", urlencoding::encode(identity))));
        Ok(url)
    }

    /// Media servers are reached over WebSocket; map http(s) to ws(s).
    fn websocket_url(server_url: &str) -> Result<String, HuddleError> {
        let server_url = server_url.trim();
        let mapped = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            server_url.to_string()
        };
        let parsed = Url::parse(&mapped)
            .map_err(|e| HuddleError::InvalidUrl(format!("{server_url}: {e}")))?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(mapped),
            other => Err(HuddleError::InvalidUrl(format!(
                "unsupported media server scheme '{other}'"
            ))),
        }
    }
}
