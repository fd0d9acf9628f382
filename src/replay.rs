use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, body::Incoming};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::capture::{CaptureError, CapturedRequest, build_request};

pub type ReplayClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Debug)]
pub enum ReplayError {
    Build(CaptureError),
    Send(String),
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Build(cause) => write!(f, "build replay request: {cause}"),
            Self::Send(cause) => write!(f, "send replay request: {cause}"),
        }
    }
}

impl std::error::Error for ReplayError {}

pub fn build_replay_client() -> anyhow::Result<ReplayClient> {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .context("load native TLS roots")?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// Re-sends a captured request straight to its origin, bypassing the proxy
/// listener. One attempt, no retries.
pub async fn replay(
    client: &ReplayClient,
    record: &CapturedRequest,
) -> Result<Response<Incoming>, ReplayError> {
    let request = build_request(record).map_err(ReplayError::Build)?;
    client
        .request(request)
        .await
        .map_err(|err| ReplayError::Send(format!("{:#}", anyhow::Error::new(err))))
}
