use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ConnectError;

/// Short-lived credentials for one realtime session
#[derive(Debug, Clone, Deserialize)]
pub struct SessionToken {
    pub token: String,
    pub url: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// `POST <endpoint>` → `{ token, url }`
///
/// No HTTP response at all means the endpoint is unreachable; any response
/// that does not carry a usable token is treated as an authorization failure.
pub async fn fetch_session_token(
    client: &reqwest::Client,
    endpoint: &str,
) -> Result<SessionToken, ConnectError> {
    info!("Requesting session token from {}", endpoint);

    let response = client
        .post(endpoint)
        .json(&serde_json::json!({}))
        .send()
        .await
        .map_err(|e| ConnectError::Unreachable(format!("token endpoint: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        warn!("Token endpoint returned {}", status);
        return Err(ConnectError::Unauthorized(format!(
            "token endpoint returned {}",
            status
        )));
    }

    response
        .json::<SessionToken>()
        .await
        .map_err(|e| ConnectError::Unauthorized(format!("malformed token response: {}", e)))
}
