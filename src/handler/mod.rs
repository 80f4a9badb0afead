//! Handler transports.
//!
//! A handler is an external program that receives a JSON request on one side
//! of a transport and returns a JSON response on the other. The transport
//! treats both as opaque bytes; parsing happens in the engine and the
//! admission server.
//!
//! Three transports exist: a subprocess ([`exec::ExecHandler`]), an HTTP
//! callout ([`http::HttpHandler`]) and an in-process function
//! ([`func::FnHandler`], used by tests and embedders). Exactly one variant is
//! configured per handler slot; the choice is validated at config load and
//! resolved here into a trait object.

mod exec;
mod func;
mod http;

pub use exec::ExecHandler;
pub use func::FnHandler;
pub use http::HttpHandler;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::HandlerConfig;
use crate::error::{Error, Result};

/// An invokable handler: opaque request bytes in, opaque response bytes out.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Invoke the handler with the given request payload.
    async fn invoke(&self, request: &[u8]) -> Result<Vec<u8>>;
}

/// Build the configured transport variant.
pub fn build(config: &HandlerConfig) -> Result<Arc<dyn Handler>> {
    config.validate()?;

    if let Some(exec) = &config.exec {
        return Ok(Arc::new(ExecHandler::new(exec.clone())));
    }
    if let Some(http) = &config.http {
        return Ok(Arc::new(HttpHandler::new(http.clone())?));
    }
    if let Some(func) = &config.func {
        return Ok(func.handler.clone());
    }

    Err(Error::InvalidConfig("handler must be specified".into()))
}
