/// Acceptor: binds the listening socket and spawns one session task per
/// accepted connection, draining them on shutdown.
use crate::backend::BackendClient;
use crate::session;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct Acceptor {
    addr: SocketAddr,
    progpow: Arc<BackendClient>,
    randomx: Arc<BackendClient>,
}

impl Acceptor {
    pub fn new(addr: SocketAddr, progpow: Arc<BackendClient>, randomx: Arc<BackendClient>) -> Self {
        Self {
            addr,
            progpow,
            randomx,
        }
    }

    /// Binds with `SO_REUSEADDR`, accepts until `cancel` fires, and waits for
    /// every in-flight session to finish before returning.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let socket = Socket::new(Domain::for_address(self.addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&self.addr.into())?;
        socket.listen(1024)?;
        let listener = TcpListener::from_std(socket.into())?;

        tracing::info!(addr = %self.addr, "listening");

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let progpow = self.progpow.clone();
                            let randomx = self.randomx.clone();
                            let session_cancel = cancel.clone();
                            tracing::debug!(peer = %peer, "accepted connection");
                            sessions.spawn(async move {
                                session::run_session(stream, peer, progpow, randomx, session_cancel).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        tracing::info!("no longer accepting, draining {} active session(s)", sessions.len());
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}
