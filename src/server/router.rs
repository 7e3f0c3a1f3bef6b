//! The outbound packet router.
//!
//! One task owns the route map and selects between two inputs: packets read
//! from the TUN side, and lifecycle events from the publisher. Serializing
//! map updates and lookups in the same task gives lock-free operation, and
//! processing events ahead of packets guarantees a Connect is reflected in
//! the map before any packet can be routed over it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::buffer::FrameBuf;
use crate::metrics::Metrics;
use crate::protocol;
use crate::server::client::{ClientEvent, Transition};

/// Route packets until the lifecycle event stream closes.
///
/// Delivery never blocks on a client: a full or closed tx sink drops the
/// packet, because one slow consumer must not stall every other client.
/// Dropped buffers return to the pool as they fall out of scope.
///
/// # Panics
///
/// Panics on a duplicate Connect insertion or a Disconnect with no matching
/// route. Either means the lifecycle contract is broken.
pub async fn route(
    mut packets: mpsc::Receiver<FrameBuf>,
    mut events: mpsc::Receiver<ClientEvent>,
    metrics: Arc<Metrics>,
) {
    let mut routes: HashMap<u32, mpsc::Sender<FrameBuf>> = HashMap::new();

    debug!("router: starting");

    loop {
        tokio::select! {
            // Events first so a freshly published Connect is visible before
            // any packet for it is looked up.
            biased;

            event = events.recv() => {
                let Some(event) = event else {
                    debug!("router: event stream closed");
                    return;
                };
                update_routes(&mut routes, &event);
            }

            packet = packets.recv() => {
                let Some(buf) = packet else {
                    debug!("router: packet stream closed");
                    return;
                };
                deliver(&routes, buf, &metrics);
            }
        }
    }
}

fn update_routes(routes: &mut HashMap<u32, mpsc::Sender<FrameBuf>>, event: &ClientEvent) {
    let key = event.client.tunnel_ip_u32();
    match event.transition {
        Transition::Connect => {
            debug!(
                ip = %event.client.tunnel_ip,
                name = %event.client.name,
                id = event.client.id,
                "router: client connect"
            );
            if routes.insert(key, event.client.tx.clone()).is_some() {
                panic!(
                    "router: duplicate route for {} ({})",
                    event.client.tunnel_ip, event.client.name
                );
            }
        }
        Transition::Disconnect => {
            debug!(
                ip = %event.client.tunnel_ip,
                name = %event.client.name,
                id = event.client.id,
                "router: client disconnect"
            );
            if routes.remove(&key).is_none() {
                panic!(
                    "router: no route to remove for {} ({})",
                    event.client.tunnel_ip, event.client.name
                );
            }
        }
    }
}

fn deliver(routes: &HashMap<u32, mpsc::Sender<FrameBuf>>, buf: FrameBuf, metrics: &Metrics) {
    let started = Instant::now();

    let Some(dst) = protocol::ipv4_destination(buf.payload()) else {
        trace!("router(drop): unparseable packet header");
        metrics.tx_dropped.inc();
        return;
    };

    match routes.get(&u32::from(dst)) {
        Some(tx) => {
            let len = buf.len() as u64;
            match tx.try_send(buf) {
                Ok(()) => {
                    metrics.tx_packets.inc();
                    metrics.tx_bytes.inc_by(len);
                    metrics.route_seconds.observe(started.elapsed().as_secs_f64());
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!("router(drop): full queue for client {dst}");
                    metrics.tx_dropped.inc();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!("router(drop): closed queue for client {dst}");
                    metrics.tx_dropped.inc();
                }
            }
        }
        None => {
            trace!("router(drop): no route for client {dst}");
            metrics.tx_dropped.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::server::client::Client;
    use crate::MTU;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, SystemTime};

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(4, 16, MTU)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn client(ip: Ipv4Addr, queue: usize) -> (Arc<Client>, mpsc::Receiver<FrameBuf>) {
        let (tx, rx) = mpsc::channel(queue);
        let (control, _control_rx) = mpsc::channel(1);
        (
            Arc::new(Client {
                name: "test".into(),
                id: rand::random(),
                tunnel_ip: ip,
                public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                connected_at: SystemTime::now(),
                disconnected_at: parking_lot::RwLock::new(None),
                tx,
                control,
            }),
            rx,
        )
    }

    fn packet(pool: &Arc<BufferPool>, src: Ipv4Addr, dst: Ipv4Addr) -> FrameBuf {
        let mut buf = pool.get();
        let payload = buf.payload_mut();
        payload[..20].fill(0);
        payload[0] = 0x45;
        payload[12..16].copy_from_slice(&src.octets());
        payload[16..20].copy_from_slice(&dst.octets());
        buf.set_len(60);
        buf
    }

    #[tokio::test]
    async fn routes_to_connected_client() {
        let metrics = Metrics::new().unwrap();
        let pool = pool();
        let (packet_tx, packet_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        let task = tokio::spawn(route(packet_rx, event_rx, metrics.clone()));

        let dst = Ipv4Addr::new(192, 168, 0, 3);
        let (c, mut c_rx) = client(dst, 8);
        event_tx.send(ClientEvent::connect(c)).await.unwrap();

        packet_tx
            .send(packet(&pool, Ipv4Addr::new(192, 168, 0, 2), dst))
            .await
            .unwrap();

        let delivered = c_rx.recv().await.unwrap();
        assert_eq!(delivered.len(), 60);
        assert_eq!(metrics.tx_packets.get(), 1);
        assert_eq!(metrics.tx_bytes.get(), 60);

        drop(event_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn drops_on_route_miss() {
        let metrics = Metrics::new().unwrap();
        let pool = pool();
        let (packet_tx, packet_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        let task = tokio::spawn(route(packet_rx, event_rx, metrics.clone()));

        packet_tx
            .send(packet(
                &pool,
                Ipv4Addr::new(192, 168, 0, 2),
                Ipv4Addr::new(192, 168, 0, 99),
            ))
            .await
            .unwrap();

        {
            let metrics = metrics.clone();
            wait_for(move || metrics.tx_dropped.get() == 1).await;
        }

        drop(packet_tx);
        drop(event_tx);
        task.await.unwrap();

        assert_eq!(metrics.tx_packets.get(), 0);
        // The dropped buffer made it back to the pool.
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn drops_instead_of_blocking_on_full_sink() {
        let metrics = Metrics::new().unwrap();
        let pool = pool();
        let (packet_tx, packet_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        let task = tokio::spawn(route(packet_rx, event_rx, metrics.clone()));

        let dst = Ipv4Addr::new(192, 168, 0, 3);
        let (c, mut c_rx) = client(dst, 1);
        event_tx.send(ClientEvent::connect(c)).await.unwrap();

        let src = Ipv4Addr::new(192, 168, 0, 2);
        packet_tx.send(packet(&pool, src, dst)).await.unwrap();
        packet_tx.send(packet(&pool, src, dst)).await.unwrap();
        packet_tx.send(packet(&pool, src, dst)).await.unwrap();

        {
            let metrics = metrics.clone();
            wait_for(move || metrics.tx_packets.get() + metrics.tx_dropped.get() == 3).await;
        }

        drop(packet_tx);
        drop(event_tx);
        task.await.unwrap();

        // Queue depth 1: first delivered, the rest dropped without blocking.
        assert_eq!(metrics.tx_packets.get(), 1);
        assert_eq!(metrics.tx_dropped.get(), 2);
        assert!(c_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn no_delivery_after_disconnect() {
        let metrics = Metrics::new().unwrap();
        let pool = pool();
        let (packet_tx, packet_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        let task = tokio::spawn(route(packet_rx, event_rx, metrics.clone()));

        let dst = Ipv4Addr::new(192, 168, 0, 3);
        let (c, mut c_rx) = client(dst, 8);
        event_tx.send(ClientEvent::connect(c.clone())).await.unwrap();
        event_tx.send(ClientEvent::disconnect(c)).await.unwrap();

        packet_tx
            .send(packet(&pool, Ipv4Addr::new(192, 168, 0, 2), dst))
            .await
            .unwrap();

        {
            let metrics = metrics.clone();
            wait_for(move || metrics.tx_dropped.get() == 1).await;
        }

        drop(packet_tx);
        drop(event_tx);
        task.await.unwrap();

        assert_eq!(metrics.tx_packets.get(), 0);
        assert!(c_rx.try_recv().is_err());
    }
}
