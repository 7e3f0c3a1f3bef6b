//! Per-client session handling.
//!
//! One task per accepted connection. The session walks the connection
//! through TLS, identity extraction, and the application handshake, then
//! publishes Connect and hands the socket halves to two companion pumps:
//!
//! - `connrx` reads wire frames, drops bogons (source address not the one
//!   this client was assigned), and pushes the rest into the shared
//!   tun-write queue;
//! - `conntx` drains the client's tx sink into the socket.
//!
//! The session task itself just selects on the ways a connection can end:
//! shutdown, a pump failing, or a disconnect control message. On exit it
//! cancels the pumps, waits for them to let go of the tx sink, and only then
//! publishes Disconnect — which is what lets the router, tracker, and
//! netblock clean up without racing the data path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::buffer::{BufferPool, FrameBuf};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::protocol::{self, handshake, ClientSettings};
use crate::server::client::{Client, ClientEvent, ControlMessage};
use crate::server::netblock::Netblock;

/// Everything a session needs from the service, shared across all sessions.
pub struct SessionShared {
    pub acceptor: TlsAcceptor,
    /// Shared tun-write queue for packets received from clients.
    pub tuntx: mpsc::Sender<FrameBuf>,
    /// Lifecycle event channel into the publisher.
    pub events: mpsc::Sender<ClientEvent>,
    pub netblock: Arc<Netblock>,
    pub pool: Arc<BufferPool>,
    pub metrics: Arc<Metrics>,
    /// Depth of each client's tx sink.
    pub client_queue: usize,
    pub handshake_timeout: Duration,
    pub shutdown: CancellationToken,
    /// Tracker the companion pumps are spawned into.
    pub tasks: TaskTracker,
}

/// Handle one accepted connection to completion.
pub async fn serve(shared: Arc<SessionShared>, conn: TcpStream, peer: SocketAddr) {
    let id: u64 = rand::random();
    debug!(id, %peer, "conn: starting");

    // TLS handshake
    let mut tls = match shared.acceptor.accept(conn).await {
        Ok(tls) => tls,
        Err(e) => {
            shared.metrics.client_fail.with_label_values(&["tls"]).inc();
            let err = Error::HandshakeFailed(e.to_string());
            warn!(%peer, "conn(term): {err}");
            return;
        }
    };
    debug!(%peer, "conn: TLS handshake completed");

    // Identity comes from the client certificate. A connection without one
    // gets a readable refusal instead of a TLS alert.
    let certs: Vec<CertificateDer<'static>> = tls
        .get_ref()
        .1
        .peer_certificates()
        .map(<[CertificateDer<'static>]>::to_vec)
        .unwrap_or_default();
    let name = match crate::tls::peer_name(&certs) {
        Ok(name) => name,
        Err(e) => {
            shared
                .metrics
                .client_fail
                .with_label_values(&["nocert"])
                .inc();
            warn!(%peer, "conn(term): error validating client: {e}");
            let _ = tls.write_all(b"HTTP/1.0 403 FORBIDDEN\n\n").await;
            let _ = tls.shutdown().await;
            return;
        }
    };

    let (rd, mut wr) = tokio::io::split(tls);
    let mut rdr = BufReader::new(rd);

    // Application-layer handshake
    let info = match tokio::time::timeout(
        shared.handshake_timeout,
        handshake::read_client_info(&mut rdr),
    )
    .await
    {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            warn!(%peer, "conn(term): application handshake failed: {e}");
            return;
        }
        Err(_) => {
            warn!(%peer, "conn(term): timed out waiting for client info");
            return;
        }
    };
    debug!(version = %info.version, "conn: got client info");

    // Allocate the tunnel address; pends while the pool is dry. From here on
    // every exit path must hand the address back, either directly or through
    // the Disconnect event.
    let ip = tokio::select! {
        _ = shared.shutdown.cancelled() => {
            debug!(%peer, "conn(term): got done signal before allocation");
            return;
        }
        ip = shared.netblock.allocate() => ip,
    };

    let settings = ClientSettings {
        time: handshake::timestamp(),
        version: crate::VERSION.to_string(),
        ip: ip.to_string(),
    };
    if let Err(e) = tokio::time::timeout(
        shared.handshake_timeout,
        handshake::write_settings(&mut wr, &settings),
    )
    .await
    .unwrap_or(Err(Error::HandshakeTimeout))
    {
        warn!(%peer, "conn(term): error sending client settings: {e}");
        shared.netblock.release(ip).await;
        return;
    }

    // Framed mode starts with the next byte; anything already buffered means
    // the peer jumped the gun.
    if !rdr.buffer().is_empty() {
        warn!(%peer, "conn(term): unread bytes after handshake");
        shared.netblock.release(ip).await;
        return;
    }

    let (tx, tx_sink) = mpsc::channel(shared.client_queue);
    let (control, mut control_rx) = mpsc::channel(4);
    let client = Arc::new(Client {
        name,
        id,
        tunnel_ip: ip,
        public_ip: peer.ip(),
        connected_at: SystemTime::now(),
        disconnected_at: parking_lot::RwLock::new(None),
        tx,
        control,
    });

    shared.metrics.connects.inc();
    if shared
        .events
        .send(ClientEvent::connect(client.clone()))
        .await
        .is_err()
    {
        // Service is gone; no Disconnect will flow, so hand the address back
        // ourselves.
        shared.netblock.release(ip).await;
        return;
    }

    info!(
        name = %client.name,
        ip = %client.tunnel_ip,
        %peer,
        id,
        "conn: client connection established"
    );

    // Companion pumps, cancellable as a unit.
    let session = shared.shutdown.child_token();
    let (read_failed_tx, mut read_failed) = mpsc::channel::<()>(1);
    let (write_failed_tx, mut write_failed) = mpsc::channel::<()>(1);

    let rx_pump = shared.tasks.spawn(connrx(
        rdr,
        shared.tuntx.clone(),
        client.clone(),
        shared.pool.clone(),
        shared.metrics.clone(),
        read_failed_tx,
        session.clone(),
    ));
    let tx_pump = shared
        .tasks
        .spawn(conntx(tx_sink, wr, write_failed_tx, session.clone()));

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                debug!(%peer, "conn(term): got done signal");
                break;
            }
            _ = read_failed.recv() => {
                debug!(%peer, "conn(term): encountered client read error");
                break;
            }
            _ = write_failed.recv() => {
                debug!(%peer, "conn(term): encountered client write error");
                break;
            }
            msg = control_rx.recv() => match msg {
                Some(ControlMessage::Disconnect) | None => {
                    debug!(%peer, "conn(term): received disconnect control");
                    break;
                }
            },
        }
    }

    // Stop the pumps and wait until the tx sink has no consumer; Disconnect
    // must not be published before then.
    session.cancel();
    let _ = rx_pump.await;
    let _ = tx_pump.await;

    *client.disconnected_at.write() = Some(SystemTime::now());
    shared.metrics.disconnects.inc();

    debug!(%peer, "conn: sending disconnect client state");
    let _ = shared
        .events
        .send(ClientEvent::disconnect(client.clone()))
        .await;

    info!(name = %client.name, ip = %client.tunnel_ip, "conn(term): auf wiedersehen");
}

/// Read pump: wire frames from the client into the shared tun-write queue.
///
/// Drops any packet whose IPv4 source is not the address assigned to this
/// connection. Counts only accepted packets.
async fn connrx<R>(
    mut rdr: R,
    tuntx: mpsc::Sender<FrameBuf>,
    client: Arc<Client>,
    pool: Arc<BufferPool>,
    metrics: Arc<Metrics>,
    failed: mpsc::Sender<()>,
    session: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    debug!("connrx: starting");

    loop {
        let buf = tokio::select! {
            _ = session.cancelled() => return,
            frame = protocol::read_frame(&mut rdr, &pool) => match frame {
                Ok(buf) => buf,
                Err(e) => {
                    debug!("connrx(term): {e}");
                    let _ = failed.try_send(());
                    return;
                }
            },
        };

        match protocol::ipv4_source(buf.payload()) {
            Some(src) if src == client.tunnel_ip => {
                metrics.rx_packets.inc();
                metrics.rx_bytes.inc_by(buf.len() as u64);
                if tuntx.send(buf).await.is_err() {
                    debug!("connrx(term): tun queue closed");
                    return;
                }
            }
            _ => {
                // Bogon: keep the session, lose the packet.
                trace!(name = %client.name, "connrx(drop): bogus source address");
            }
        }
    }
}

/// Write pump: the client's tx sink onto the socket, one frame at a time.
async fn conntx<W>(
    mut packets: mpsc::Receiver<FrameBuf>,
    mut wr: W,
    failed: mpsc::Sender<()>,
    session: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    debug!("conntx: starting");

    loop {
        let buf = tokio::select! {
            _ = session.cancelled() => return,
            buf = packets.recv() => match buf {
                Some(buf) => buf,
                None => return,
            },
        };

        // The write stays cancellable so a stalled peer cannot hold up
        // teardown; an abandoned partial frame is fine on a dying session.
        tokio::select! {
            _ = session.cancelled() => return,
            written = protocol::write_frame(&mut wr, &buf) => {
                if let Err(e) = written {
                    debug!("conntx(term): {e}");
                    let _ = failed.try_send(());
                    return;
                }
            }
        }
    }
}
