//! The accept pump.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pump the listener into a connection channel.
///
/// Exits on shutdown, on a failed accept (e.g. the process ran out of file
/// handles), or when the service stops consuming connections. Closing the
/// channel is the signal that no more clients will arrive.
pub async fn accept(
    listener: TcpListener,
    conns: mpsc::Sender<(TcpStream, SocketAddr)>,
    shutdown: CancellationToken,
) {
    debug!("acceptor: starting");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("acceptor: got done signal");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    if conns.send((conn, peer)).await.is_err() {
                        debug!("acceptor: connection channel closed");
                        return;
                    }
                }
                Err(e) => {
                    warn!("acceptor: accept failed: {e}");
                    return;
                }
            },
        }
    }
}
