//! Packet pumps between TUN queues and channels.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::{BufferPool, FrameBuf};
use crate::protocol;
use crate::tun::TunQueue;

/// Read packets off a TUN queue and push them into `packets`.
///
/// Fills a pooled buffer's payload region and stamps the wire header, so the
/// frame is ready to hit a socket without another copy. Non-IPv4 packets are
/// dropped at the source. Exits on shutdown, queue error, or a closed
/// channel; dropped buffers return to the pool either way.
pub async fn tun_rx(
    queue: Arc<TunQueue>,
    packets: mpsc::Sender<FrameBuf>,
    pool: Arc<BufferPool>,
    shutdown: CancellationToken,
) {
    debug!("tunrx: starting");

    loop {
        let mut buf = pool.get();

        let n = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("tunrx: got done signal");
                return;
            }
            read = queue.read(buf.payload_mut()) => match read {
                Ok(0) => {
                    debug!("tunrx: device closed");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("tunrx: error reading: {e}");
                    return;
                }
            },
        };
        buf.set_len(n);

        if !protocol::is_ipv4(buf.payload()) {
            continue;
        }

        if packets.send(buf).await.is_err() {
            debug!("tunrx: packet channel closed");
            return;
        }
    }
}

/// Drain the shared tun-write queue into a TUN queue.
///
/// A write that returns a different count than the packet length means the
/// queue is wedged; the pump stops and takes the device down with it.
pub async fn tun_tx(
    queue: Arc<TunQueue>,
    mut packets: mpsc::Receiver<FrameBuf>,
    shutdown: CancellationToken,
) {
    debug!("tuntx: starting");

    loop {
        let buf = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("tuntx: got done signal");
                return;
            }
            buf = packets.recv() => match buf {
                Some(buf) => buf,
                None => {
                    debug!("tuntx: packet channel closed");
                    return;
                }
            },
        };

        match queue.write(buf.payload()).await {
            Ok(n) if n == buf.len() => {}
            Ok(n) => {
                warn!("tuntx: short write {n} of {}", buf.len());
                return;
            }
            Err(e) => {
                warn!("tuntx: error writing: {e}");
                return;
            }
        }
    }
}
