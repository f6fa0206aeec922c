use std::fmt;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::future::BoxFuture;
use tower::BoxError;
use tower::Service;
use tracing::trace;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::request::BotRequest;
use crate::request::BotResponse;

// Error bodies longer than this are truncated in synthesized descriptions.
const MAX_DESCRIPTION: usize = 200;

/// Bot API client speaking JSON over HTTPS.
///
/// Each request is POSTed to `{api_base}/bot{token}/{method}`. A reply whose
/// body is not an envelope is turned into a failed envelope carrying the
/// HTTP status, so a proxy's 502 page is classified like any other 5xx.
#[derive(Clone)]
pub struct TelegramTransport {
    client: reqwest::Client,
    endpoint: Arc<str>,
}

impl fmt::Debug for TelegramTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the endpoint embeds the token
        f.debug_struct("TelegramTransport")
            .field("endpoint", &"<redacted>")
            .finish()
    }
}

impl TelegramTransport {
    pub fn new(token: &str, config: &TransportConfig) -> Result<Self, TransportError> {
        let token = token.trim();
        if token.is_empty() || token.contains('/') || token.contains(char::is_whitespace) {
            return Err(TransportError::InvalidToken);
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token).into(),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.endpoint, method)
    }
}

async fn post(
    client: reqwest::Client,
    url: String,
    request: BotRequest,
) -> Result<BotResponse, TransportError> {
    let response = client.post(&url).json(&request).send().await?;
    let status = response.status();
    let body = response.bytes().await?;
    trace!(method = request.method(), status = status.as_u16(), "bot api reply");

    match serde_json::from_slice::<BotResponse>(&body) {
        Ok(envelope) => Ok(envelope),
        Err(source) if status.is_success() => Err(TransportError::Decode {
            status: status.as_u16(),
            source,
        }),
        Err(_) => Ok(BotResponse {
            ok: false,
            error_code: Some(status.as_u16()),
            description: Some(
                String::from_utf8_lossy(&body)
                    .chars()
                    .take(MAX_DESCRIPTION)
                    .collect(),
            ),
            ..Default::default()
        }),
    }
}

impl Service<BotRequest> for TelegramTransport {
    type Response = BotResponse;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<BotResponse, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: BotRequest) -> Self::Future {
        let client = self.client.clone();
        let url = self.url(request.method());
        Box::pin(async move { post(client, url, request).await.map_err(BoxError::from) })
    }
}
