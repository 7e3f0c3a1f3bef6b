//! The tunnel address pool.
//!
//! A pre-filled bounded channel of every assignable host address in the
//! server CIDR: everything except the network address, the server's own
//! address (the first host), and the broadcast address. Sessions pull from
//! the pool during the application handshake and pend when it runs dry; a
//! task subscribed to lifecycle events returns each Disconnecting client's
//! address.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::server::client::{ClientEvent, Transition};

/// A released address must land back in the pool within this window. The
/// pool can only be full if something released an address it never owned, so
/// exceeding the deadline is a design bug, not load.
const RELEASE_DEADLINE: Duration = Duration::from_secs(1);

/// The IPv4 address pool for one server netblock.
pub struct Netblock {
    capacity: u32,
    tx: mpsc::Sender<Ipv4Addr>,
    rx: Mutex<mpsc::Receiver<Ipv4Addr>>,
    metrics: Arc<Metrics>,
}

impl Netblock {
    /// Build the pool from the server CIDR. The CIDR's address part is the
    /// server's own tunnel address and is excluded from the pool along with
    /// the network and broadcast addresses.
    pub fn new(cidr: Ipv4Net, metrics: Arc<Metrics>) -> Result<Arc<Self>> {
        let span = 1u32
            .checked_shl(32 - u32::from(cidr.prefix_len()))
            .ok_or_else(|| Error::InvalidConfig("netblock prefix out of range".into()))?;
        if span < 4 {
            return Err(Error::InvalidConfig(format!(
                "netblock /{} has no assignable client addresses",
                cidr.prefix_len()
            )));
        }
        let capacity = span - 3;

        let (tx, rx) = mpsc::channel(capacity as usize);
        let base = u32::from(cidr.network());

        // Host offsets 2..=span-2: skips network (+0), server (+1), and
        // broadcast (+span-1).
        for offset in 2..span - 1 {
            tx.try_send(Ipv4Addr::from(base + offset))
                .expect("pool prefill within capacity");
        }

        metrics
            .ip_usage
            .with_label_values(&["free"])
            .set(i64::from(capacity));
        metrics.ip_usage.with_label_values(&["allocated"]).set(0);

        info!(
            %cidr,
            addresses = capacity,
            "netblock: pool filled"
        );

        Ok(Arc::new(Self {
            capacity,
            tx,
            rx: Mutex::new(rx),
            metrics,
        }))
    }

    /// Number of assignable addresses in the block.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Take the next free address, pending while the pool is empty.
    pub async fn allocate(&self) -> Ipv4Addr {
        let ip = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .expect("netblock pool sender lives as long as the pool");

        self.metrics.ip_usage.with_label_values(&["free"]).dec();
        self.metrics.ip_usage.with_label_values(&["allocated"]).inc();
        debug!(%ip, "netblock: allocated");
        ip
    }

    /// Return an address to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the pool cannot absorb the address within the release
    /// deadline, which can only mean a double release.
    pub async fn release(&self, ip: Ipv4Addr) {
        match self.tx.send_timeout(ip, RELEASE_DEADLINE).await {
            Ok(()) => {
                self.metrics.ip_usage.with_label_values(&["free"]).inc();
                self.metrics.ip_usage.with_label_values(&["allocated"]).dec();
                let free = self.tx.max_capacity() - self.tx.capacity();
                debug!(%ip, free, "netblock: recovered ip");
            }
            Err(_) => {
                panic!("netblock: timed out returning {ip} to the pool");
            }
        }
    }

    /// Observe lifecycle events and recycle addresses on Disconnect. Exits
    /// when the event stream closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ClientEvent>) {
        debug!("netblock: starting");

        while let Some(event) = events.recv().await {
            if event.transition == Transition::Disconnect {
                self.release(event.client.tunnel_ip).await;
            }
        }

        debug!("netblock: event stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn metrics() -> Arc<Metrics> {
        Metrics::new().unwrap()
    }

    #[tokio::test]
    async fn excludes_network_server_and_broadcast() {
        // /29 spans 8 addresses: .0 network, .1 server, .7 broadcast,
        // leaving .2 through .6.
        let net: Ipv4Net = "10.0.0.1/29".parse().unwrap();
        let pool = Netblock::new(net, metrics()).unwrap();
        assert_eq!(pool.capacity(), 5);

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let ip = pool.allocate().await;
            assert!(seen.insert(ip), "duplicate address {ip}");
            let last = ip.octets()[3];
            assert!((2..=6).contains(&last), "{ip} outside assignable range");
        }
    }

    #[tokio::test]
    async fn first_allocation_is_dot_two() {
        let net: Ipv4Net = "192.168.0.1/21".parse().unwrap();
        let pool = Netblock::new(net, metrics()).unwrap();
        assert_eq!(pool.capacity(), 2045);
        assert_eq!(pool.allocate().await, Ipv4Addr::new(192, 168, 0, 2));
        assert_eq!(pool.allocate().await, Ipv4Addr::new(192, 168, 0, 3));
    }

    #[tokio::test]
    async fn empty_pool_pends_until_release() {
        let net: Ipv4Net = "10.0.0.1/29".parse().unwrap();
        let pool = Netblock::new(net, metrics()).unwrap();

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.allocate().await);
        }

        // Nothing left; allocate must pend.
        let pending = tokio::time::timeout(Duration::from_millis(50), pool.allocate()).await;
        assert!(pending.is_err());

        pool.release(held.pop().unwrap()).await;
        let ip = tokio::time::timeout(Duration::from_millis(50), pool.allocate())
            .await
            .expect("allocation proceeds after release");
        assert_eq!(ip.octets()[3], 6);
    }

    #[tokio::test]
    async fn recycles_in_fifo_order() {
        let net: Ipv4Net = "10.0.0.1/29".parse().unwrap();
        let pool = Netblock::new(net, metrics()).unwrap();

        let a = pool.allocate().await; // .2
        let _b = pool.allocate().await; // .3
        pool.release(a).await;

        // .4, .5, .6 drain first, then the recycled .2.
        for expected in [4u8, 5, 6, 2] {
            assert_eq!(pool.allocate().await.octets()[3], expected);
        }
    }
}
