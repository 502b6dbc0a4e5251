use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;

use crate::client::config::Config;
use crate::client::consts::{AUTHORIZATION_HEADER, OPENAI_BETA_HEADER};

pub fn build_request(config: &Config) -> Result<Request> {
    let mut request = format!("{}/realtime?model={}", config.base_url(), config.model())
        .into_client_request()
        .context("invalid realtime endpoint url")?;
    request.headers_mut().insert(
        AUTHORIZATION_HEADER,
        format!("Bearer {}", config.api_key().expose_secret())
            .parse()
            .context("api key is not a valid header value")?,
    );
    request.headers_mut().insert(
        OPENAI_BETA_HEADER,
        "realtime=v1".parse().context("beta header value")?,
    );
    Ok(request)
}
