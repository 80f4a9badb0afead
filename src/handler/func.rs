//! In-process handler transport.

use async_trait::async_trait;

use super::Handler;
use crate::error::Result;

/// Wraps a plain function as a [`Handler`]. No timeout is enforced.
///
/// This is the transport tests and embedders use in place of an external
/// program.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    /// Wrap the given function.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    async fn invoke(&self, request: &[u8]) -> Result<Vec<u8>> {
        (self.f)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn passes_bytes_through() {
        let handler = FnHandler::new(|req: &[u8]| {
            let mut out = req.to_vec();
            out.reverse();
            Ok(out)
        });
        assert_eq!(handler.invoke(b"abc").await.unwrap(), b"cba");
    }

    #[tokio::test]
    async fn propagates_errors() {
        let handler = FnHandler::new(|_: &[u8]| Err(Error::Transport("down".into())));
        assert!(handler.invoke(b"{}").await.is_err());
    }
}
