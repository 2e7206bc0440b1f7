use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Method,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};
use secrecy::{ExposeSecret, Secret};
use url::Url;

use crate::{Error, Result};

/// A fully encoded request, ready to be handed to a [`Transport`]
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The raw response to a [`PreparedRequest`]
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The capability of issuing one HTTP request over one pooled connection
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    async fn execute(
        &self,
        request: PreparedRequest,
        timeout: Duration,
    ) -> Result<TransportResponse>;
}

/// A [`Transport`] backed by a [`reqwest::Client`]
///
/// Each instance owns its own connection pool, so creating one per pooled connection
/// spreads the load over distinct connections.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(Error::HttpClient)?;
        Ok(Self::with_client(http_client))
    }

    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: PreparedRequest,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        let PreparedRequest {
            method,
            url,
            headers,
            body,
        } = request;
        let response = self
            .http_client
            .request(method.clone(), url.clone())
            .headers(headers)
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|src| Error::transport(method, url.as_str(), src))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(Error::ResponseBody)?;
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

/// Mutates a [`PreparedRequest`] to carry credentials, right before it is sent
pub trait Authenticator: Debug + Send + Sync + 'static {
    fn authenticate(&self, request: &mut PreparedRequest) -> Result<()>;
}

/// Sends `Authorization: Bearer <token>` with every request
#[derive(Debug, Clone)]
pub struct BearerToken {
    token: Secret<String>,
}

impl BearerToken {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: Secret::new(token.into()),
        }
    }
}

impl From<Secret<String>> for BearerToken {
    fn from(token: Secret<String>) -> Self {
        Self { token }
    }
}

impl Authenticator for BearerToken {
    fn authenticate(&self, request: &mut PreparedRequest) -> Result<()> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.token.expose_secret()))
            .map_err(|e| Error::Authentication(e.to_string()))?;
        value.set_sensitive(true);
        request.headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}
