//! HTTP handler transport.

use async_trait::async_trait;
use tracing::debug;

use super::Handler;
use crate::config::HttpHandlerConfig;
use crate::error::{Error, Result};

/// POSTs the request as `application/json` to the configured URL.
///
/// Supports mutual TLS via a client certificate/key pair and an optional CA
/// bundle for server verification.
pub struct HttpHandler {
    config: HttpHandlerConfig,
    client: reqwest::Client,
}

impl HttpHandler {
    /// Build the handler and its underlying client from configuration.
    pub fn new(config: HttpHandlerConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(tls) = &config.tls {
            let mut identity_pem = std::fs::read(&tls.cert_file)?;
            identity_pem.extend(std::fs::read(&tls.key_file)?);
            let identity = reqwest::Identity::from_pem(&identity_pem)
                .map_err(|e| Error::InvalidConfig(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);

            if !tls.ca_cert_file.is_empty() {
                let ca_pem = std::fs::read(&tls.ca_cert_file)?;
                let ca = reqwest::Certificate::from_pem(&ca_pem)
                    .map_err(|e| Error::InvalidConfig(format!("invalid CA bundle: {e}")))?;
                builder = builder.add_root_certificate(ca);
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl Handler for HttpHandler {
    async fn invoke(&self, request: &[u8]) -> Result<Vec<u8>> {
        if self.config.debug {
            debug!(
                url = %self.config.url,
                body = %String::from_utf8_lossy(request),
                "invoking handler endpoint"
            );
        }

        let response = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::HandlerTimeout(self.config.timeout.unwrap_or_default())
                } else {
                    Error::Transport(format!("POST {} failed: {e}", self.config.url))
                }
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("reading response from {}: {e}", self.config.url)))?;

        if !status.is_success() {
            return Err(Error::HandlerHttp {
                url: self.config.url.clone(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        if body.is_empty() {
            return Err(Error::Transport(format!(
                "empty response body from {}",
                self.config.url
            )));
        }

        if self.config.debug {
            debug!(
                url = %self.config.url,
                body = %String::from_utf8_lossy(&body),
                "handler endpoint responded"
            );
        }

        Ok(body.to_vec())
    }
}
