//! Outbound HTTP: arbitrary requests triggered by queue payloads and webhook notifications.

use crate::infrastructure::traits::OutboundHttp;
use async_trait::async_trait;
use di::{inject, injectable};
use log::{debug, warn};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An outbound call described by a `sendRequest` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OutboundRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub params: Option<HashMap<String, String>>,
}

/// Notification posted to registered webhooks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookEvent {
    pub conn: String,
    pub message: String,
    pub sent_by: String,
    pub department: String,
    pub agent: String,
    pub tag: String,
    pub is_open: bool,
}

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("request url is empty")]
    MissingUrl,

    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
}

pub struct HttpOutbound {
    client: reqwest::Client,
}

#[injectable(OutboundHttp)]
impl HttpOutbound {
    #[inject]
    pub fn create() -> HttpOutbound {
        HttpOutbound {
            client: reqwest::Client::new(),
        }
    }
}

fn method_of(raw: &str) -> Result<Method, OutboundError> {
    if raw.trim().is_empty() {
        return Ok(Method::GET);
    }
    raw.trim()
        .to_ascii_uppercase()
        .parse::<Method>()
        .map_err(|_| OutboundError::InvalidMethod(raw.to_owned()))
}

#[async_trait]
impl OutboundHttp for HttpOutbound {
    async fn send_request(&self, request: &OutboundRequest) -> Result<(), OutboundError> {
        if request.url.trim().is_empty() {
            return Err(OutboundError::MissingUrl);
        }

        let mut builder = self
            .client
            .request(method_of(&request.method)?, &request.url)
            .timeout(REQUEST_TIMEOUT);
        if let Some(headers) = &request.headers {
            for (key, value) in headers {
                builder = builder.header(key.as_str(), value.as_str());
            }
        }
        if let Some(params) = &request.params {
            builder = builder.query(params);
        }
        if let Some(body) = request.body.as_ref().filter(|body| !body.is_null()) {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|source| OutboundError::Transport {
                url: request.url.clone(),
                source,
            })?;

        // Remote rejections are logged, never retried.
        if response.status().is_success() {
            debug!(
                "request {} {} succeeded with status {}",
                request.action,
                request.url,
                response.status()
            );
        } else {
            warn!(
                "request {} {} failed with status {}",
                request.action,
                request.url,
                response.status()
            );
        }
        Ok(())
    }

    async fn post_webhook(&self, url: &str, event: &WebhookEvent) -> Result<(), OutboundError> {
        let response = self
            .client
            .post(url)
            .timeout(REQUEST_TIMEOUT)
            .json(event)
            .send()
            .await
            .map_err(|source| OutboundError::Transport {
                url: url.to_owned(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(OutboundError::Status {
                url: url.to_owned(),
                status: response.status().as_u16(),
            })
        }
    }
}
