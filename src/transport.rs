//! Byte-range capable fetcher used by the download coordinator.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::{
    HeaderMap, AUTHORIZATION, CONTENT_RANGE, ETAG, IF_RANGE, LAST_MODIFIED, RANGE,
};
use reqwest::StatusCode;
use std::time::Duration;

use crate::error::TransportError;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub auth_token: Option<String>,
    /// Bytes already on disk; 0 starts a fresh transfer.
    pub offset: u64,
    /// ETag or Last-Modified from the response that produced the partial data.
    pub validator: Option<String>,
}

pub struct FetchResponse {
    /// Size of the whole resource, not of this response.
    pub total_bytes: Option<u64>,
    /// The body continues at `offset`. When false the body starts at byte 0.
    pub resumed: bool,
    pub validator: Option<String>,
    pub body: ByteStream,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn open(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("edgechat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn open(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        let mut builder = self.client.get(&request.url);
        if let Some(token) = request.auth_token.as_deref().filter(|t| !t.is_empty()) {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if request.offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.offset));
            if let Some(v) = &request.validator {
                builder = builder.header(IF_RANGE, v.as_str());
            }
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            log::warn!("[transport] HTTP {} for {}", status.as_u16(), request.url);
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        }

        let resumed = request.offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let total_bytes =
            total_size(resp.headers(), resp.content_length(), resumed, request.offset);
        let validator = validator_of(resp.headers());
        if request.offset > 0 && !resumed {
            log::info!("[transport] server ignored range for {}, restarting", request.url);
        }

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Read(e.to_string())))
            .boxed();
        Ok(FetchResponse {
            total_bytes,
            resumed,
            validator,
            body,
        })
    }
}

fn total_size(
    headers: &HeaderMap,
    content_length: Option<u64>,
    resumed: bool,
    offset: u64,
) -> Option<u64> {
    if resumed {
        // Content-Range: bytes 100-999/1000
        let from_range = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok());
        from_range.or_else(|| content_length.map(|len| len + offset))
    } else {
        content_length
    }
}

fn validator_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .or_else(|| headers.get(LAST_MODIFIED))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
