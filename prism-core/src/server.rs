//! Connection manager.
//!
//! Owns the listening socket and, per session, splits the framed
//! stream into a reader loop and a writer task joined by the work
//! queue:
//!
//! - **Reader**: deframes messages and invokes the dispatcher
//!   synchronously, so all rendering-API calls happen here and
//!   messages are processed in arrival order.
//! - **Writer**: sole consumer of the work queue and sole caller of
//!   the socket's write half.
//!
//! One session is live at a time; while it runs, additional
//! connections are accepted and immediately dropped with a warning.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use crate::device::Backend;
use crate::dispatch::Dispatcher;
use crate::error::PrismError;
use crate::queue::{self, WorkQueue};
use crate::wire::WireCodec;

/// The bridge server.
pub struct Server {
    listener: TcpListener,
    backend: Arc<dyn Backend>,
    verbose: bool,
}

impl Server {
    /// Bind the listening socket. Pass port 0 to let the OS choose
    /// (used by the tests).
    pub async fn bind(
        port: u16,
        backend: Arc<dyn Backend>,
        verbose: bool,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        Ok(Self {
            listener,
            backend,
            verbose,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve sessions until the listener fails or the
    /// future is dropped (the caller typically races this against a
    /// shutdown signal).
    pub async fn run(self) -> Result<(), PrismError> {
        loop {
            info!("accepting on {}", self.listener.local_addr()?);
            let (stream, peer) = self.listener.accept().await?;
            info!("client connected: {peer}");

            let session = serve_session(stream, Arc::clone(&self.backend), self.verbose);
            tokio::pin!(session);

            loop {
                tokio::select! {
                    result = &mut session => {
                        match result {
                            Ok(()) => info!("session ended: {peer}"),
                            Err(e) => error!("session failed: {e}"),
                        }
                        break;
                    }
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((_, other)) => {
                                warn!("rejecting {other}: a session is already live");
                            }
                            Err(e) => warn!("accept failed: {e}"),
                        }
                    }
                }
            }
        }
    }
}

/// Drive one client session to completion.
async fn serve_session(
    stream: TcpStream,
    backend: Arc<dyn Backend>,
    verbose: bool,
) -> Result<(), PrismError> {
    let _ = stream.set_nodelay(true);

    let framed = Framed::new(stream, WireCodec);
    let (sink, mut messages) = framed.split();

    let (work_queue, rx) = WorkQueue::channel();
    let writer = tokio::spawn(queue::drain(rx, sink));

    let mut dispatcher = Dispatcher::new(backend, verbose);

    let mut result = Ok(());
    'read: while let Some(frame) = messages.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        match dispatcher.dispatch(&message) {
            Ok(replies) => {
                for reply in replies {
                    if let Err(e) = work_queue.post(reply).await {
                        result = Err(e);
                        break 'read;
                    }
                }
            }
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    // Closing the queue lets the writer flush whatever is pending and
    // exit.
    drop(work_queue);
    match writer.await {
        Ok(Ok(())) => result,
        Ok(Err(e)) => result.and(Err(e)),
        Err(join) => result.and(Err(PrismError::Io(std::io::Error::other(join)))),
    }
}
