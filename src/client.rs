//! The wire-exchange capability consumed by the core.
//!
//! The core never opens a socket. Whoever embeds it supplies a [`Client`]
//! that can put one request on the wire to one server and hand back the
//! response; UDP/TCP/TLS selection, retries over TCP after truncation, and
//! connection reuse all live behind this seam.

use std::{future::Future, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::error::Error;

/// A single request/response exchange with a named server.
#[async_trait]
pub trait Client: Send + Sync {
    /// Send `request` to `server` and await its response.
    ///
    /// Implementations must honour caller cancellation (dropping the
    /// returned future abandons the exchange) and should return transport
    /// failures as [`Error`]s with the timeout/temporary classifiers set.
    async fn exchange(
        &self,
        request: Message,
        server: SocketAddr,
    ) -> Result<(Message, Duration), Error>;
}

#[async_trait]
impl<C: Client + ?Sized> Client for std::sync::Arc<C> {
    async fn exchange(
        &self,
        request: Message,
        server: SocketAddr,
    ) -> Result<(Message, Duration), Error> {
        (**self).exchange(request, server).await
    }
}

/// A [`Client`] backed by a plain async function.
///
/// Handy for tests and for embedders whose transport is a closure away.
pub struct ExchangeFn<F>(pub F);

#[async_trait]
impl<F, Fut> Client for ExchangeFn<F>
where
    F: Fn(Message, SocketAddr) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(Message, Duration), Error>> + Send,
{
    async fn exchange(
        &self,
        request: Message,
        server: SocketAddr,
    ) -> Result<(Message, Duration), Error> {
        (self.0)(request, server).await
    }
}
