//! HTTP/1 server dispatching into [`IpfsProxyHandler`]

use crate::error::{ProxyError, Result};
use crate::handler::IpfsProxyHandler;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Proxy HTTP server
pub struct ProxyServer {
    handler: Arc<IpfsProxyHandler>,
    addr: SocketAddr,
}

impl ProxyServer {
    /// Create a new server
    ///
    /// # Arguments
    /// * `handler` - Shared request handler
    /// * `addr` - Address to bind to
    pub fn new(handler: Arc<IpfsProxyHandler>, addr: SocketAddr) -> Self {
        Self { handler, addr }
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            ProxyError::IoError(format!("Failed to bind {}: {}", self.addr, e))
        })?;
        info!("IPFS proxy listening on http://{}", listener.local_addr()?);

        tokio::select! {
            result = serve(listener, self.handler) => result,
            _ = shutdown => {
                info!("Shutdown signal received, stopping accept loop");
                Ok(())
            }
        }
    }
}

/// Accept connections on `listener` forever, one task per connection
pub async fn serve(listener: TcpListener, handler: Arc<IpfsProxyHandler>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let handler = Arc::clone(&handler);

        tokio::task::spawn(async move {
            debug!("Accepted connection from {}", peer);
            let service = service_fn(move |req| {
                let handler = Arc::clone(&handler);
                async move { Ok::<_, Infallible>(handler.handle(req, Some(peer)).await) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection from {}: {:?}", peer, err);
            }
        });
    }
}
