//! Network Server
//!
//! TCP accept loop. Each connection is handed to a handler on its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::Result;

/// Per-connection callback
pub type ConnectionHandler =
    Arc<dyn Fn(TcpStream, SocketAddr) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Listening socket plus shutdown signal
pub struct NetworkServer {
    listener: TcpListener,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Bind the listening socket
    pub async fn bind(bind_address: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self { listener, shutdown })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Receiver that flips to `true` on [`NetworkServer::stop`]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Accept connections until stopped
    pub async fn start(&self, handler: ConnectionHandler) -> Result<()> {
        tracing::info!("Listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        while !*shutdown_rx.borrow() {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                if let Err(e) = handler(socket, addr).await {
                                    tracing::warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Server on {} stopped", self.local_addr()?);
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_accept_and_stop() {
        let server = Arc::new(NetworkServer::bind("127.0.0.1:0").await.unwrap());
        let addr = server.local_addr().unwrap();

        let handler: ConnectionHandler = Arc::new(|mut socket: TcpStream, _addr: SocketAddr| {
            async move {
                socket.write_all(b"hi").await?;
                Ok::<(), crate::Error>(())
            }
            .boxed()
        });

        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.start(handler).await })
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        server.stop();
        task.await.unwrap().unwrap();
    }
}
