//! The client side of the tunnel.
//!
//! Mirrors one server session from the other end: dial the server over TLS
//! (verifying it against the configured CA), run the application handshake,
//! bring the local TUN device up on the address the server assigned, then
//! pump packets both ways until shutdown or a socket error.

use std::net::Ipv4Addr;

use anyhow::anyhow;
use rustls::pki_types::ServerName;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{self, handshake, ClientInfo};
use crate::tun::TunDevice;
use crate::MTU;

/// Connect and run until shutdown or the connection dies.
pub async fn run(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let tls_config = crate::tls::client_config(&config.tls)?;
    let connector = TlsConnector::from(tls_config);

    let server_name = ServerName::try_from(config.client.server_name.clone())
        .map_err(|_| Error::InvalidConfig(format!("bad server_name {}", config.client.server_name)))?;

    let stream = TcpStream::connect(&config.client.server_addr).await?;
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
    info!(addr = %config.client.server_addr, "client: tls handshake succeeded");

    let (rd, mut wr) = tokio::io::split(tls);
    let mut rdr = BufReader::new(rd);

    // Application-layer handshake
    let settings = tokio::time::timeout(config.client.handshake_timeout, async {
        handshake::write_client_info(&mut wr, &ClientInfo::now()).await?;
        handshake::read_settings(&mut rdr).await
    })
    .await
    .map_err(|_| Error::HandshakeTimeout)??;

    if !rdr.buffer().is_empty() {
        return Err(Error::BadHandshake(
            "unread bytes after handshake".into(),
        ));
    }

    let ip: Ipv4Addr = settings
        .ip
        .parse()
        .map_err(|_| Error::BadHandshake(format!("bad tunnel address {:?}", settings.ip)))?;
    info!(%ip, version = %settings.version, "client: got settings");

    // Bring the tunnel interface up on the assigned address.
    let tun = TunDevice::open(&config.client.tun_name, 1)?;
    tun.configure(ip, config.client.prefix_len, MTU)?;

    let pool = BufferPool::new(64, config.limits.pool_buffers, MTU);
    let (to_server, mut to_server_rx) = mpsc::channel(config.limits.router_queue);
    let (to_tun, to_tun_rx) = mpsc::channel(config.limits.tun_queue);

    let session = shutdown.child_token();
    let tasks = TaskTracker::new();

    let queue = tun.queues()[0].clone();
    tasks.spawn(crate::tun::tun_rx(
        queue.clone(),
        to_server,
        pool.clone(),
        session.clone(),
    ));
    tasks.spawn(crate::tun::tun_tx(queue, to_tun_rx, session.clone()));

    // Read pump: frames from the server onto the TUN device.
    let (read_failed_tx, mut read_failed) = mpsc::channel::<()>(1);
    {
        let pool = pool.clone();
        let session = session.clone();
        tasks.spawn(async move {
            debug!("connrx: starting");
            loop {
                let buf = tokio::select! {
                    _ = session.cancelled() => return,
                    frame = protocol::read_frame(&mut rdr, &pool) => match frame {
                        Ok(buf) => buf,
                        Err(e) => {
                            debug!("connrx(term): {e}");
                            let _ = read_failed_tx.try_send(());
                            return;
                        }
                    },
                };
                if to_tun.send(buf).await.is_err() {
                    debug!("connrx(term): tun queue closed");
                    return;
                }
            }
        });
    }

    // Write pump: TUN packets to the server as wire frames.
    let (write_failed_tx, mut write_failed) = mpsc::channel::<()>(1);
    {
        let session = session.clone();
        tasks.spawn(async move {
            debug!("conntx: starting");
            loop {
                let buf = tokio::select! {
                    _ = session.cancelled() => return,
                    buf = to_server_rx.recv() => match buf {
                        Some(buf) => buf,
                        None => return,
                    },
                };
                tokio::select! {
                    _ = session.cancelled() => return,
                    written = protocol::write_frame(&mut wr, &buf) => {
                        if let Err(e) = written {
                            debug!("conntx(term): {e}");
                            let _ = write_failed_tx.try_send(());
                            return;
                        }
                    }
                }
            }
        });
    }

    let result = tokio::select! {
        _ = shutdown.cancelled() => {
            info!("client(term): done");
            Ok(())
        }
        _ = read_failed.recv() => Err(Error::Other(anyhow!("error reading from server"))),
        _ = write_failed.recv() => Err(Error::Other(anyhow!("error writing to server"))),
    };

    session.cancel();
    tasks.close();
    tasks.wait().await;

    result
}
