//! Outbound delivery through the HTTP relay.
//!
//! A message is posted as `{topic, payload}` to `<base>/_hs/message`, with the message's query (if any) URL-encoded
//! onto the request. Any status below 400 is a success; otherwise the response body text becomes the failure detail.

use crate::errors::RelayError;
use libhsync::OutboundMessage;
use log::*;
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;

pub const RELAY_PATH: &str = "_hs/message";

/// The relay endpoint for a base address, without doubling the separator.
pub fn relay_url(base: &str) -> String {
    let base = base.trim();
    if base.ends_with('/') {
        format!("{base}{RELAY_PATH}")
    } else {
        format!("{base}/{RELAY_PATH}")
    }
}

#[derive(Serialize)]
struct RelayBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Value>,
}

#[derive(Clone, Debug)]
pub struct RelayClient {
    http: reqwest::Client,
    url: Url,
}

impl RelayClient {
    pub fn new(base: &str) -> Result<Self, RelayError> {
        Self::with_client(reqwest::Client::new(), base)
    }

    pub fn with_client(http: reqwest::Client, base: &str) -> Result<Self, RelayError> {
        let url = relay_url(base);
        let url = Url::parse(&url).map_err(|_| RelayError::InvalidAddress(url))?;
        Ok(Self { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn publish(&self, message: &OutboundMessage) -> Result<(), RelayError> {
        let body = RelayBody { topic: message.topic.as_deref(), payload: message.payload.as_ref() };
        let mut request = self.http.post(self.url.clone()).json(&body);
        let query = message.query_pairs();
        if !query.is_empty() {
            request = request.query(&query);
        }
        trace!("Posting message to relay {}", self.url);
        let response = request.send().await?;
        let status = response.status().as_u16();
        let detail = response.text().await?;
        if status >= 400 {
            warn!("Relay {} rejected message with status {status}", self.url);
            return Err(RelayError::Delivery { status, detail });
        }
        debug!("Relay {} accepted message with status {status}", self.url);
        Ok(())
    }
}
