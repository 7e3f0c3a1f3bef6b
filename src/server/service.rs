//! The VPN server service: wiring and lifecycle.
//!
//! `Service::run` assembles the whole data plane, then sits in the accept
//! loop spawning sessions. Shutdown unwinds in dependency order: stop
//! accepting, drain every session (each publishes its Disconnect), then
//! close the lifecycle source so the publisher cascades closure into the
//! router, tracker, and netblock, and finally wait out the TUN pumps.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::{self, Metrics};
use crate::server::netblock::Netblock;
use crate::server::publisher::{self, Subscription};
use crate::server::session::{self, SessionShared};
use crate::server::{acceptor, router, tracker};
use crate::tun::{self, TunDevice};
use crate::MTU;

/// The VPN server service.
pub struct Service {
    config: Config,
}

impl Service {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run until the shutdown token fires, then drain gracefully.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let metrics = Metrics::new()?;

        let tls_config = crate::tls::server_config(&self.config.tls)?;
        let acceptor = TlsAcceptor::from(tls_config);

        let cidr = self.config.server.cidr;
        let netblock = Netblock::new(cidr, metrics.clone())?;
        let pool = BufferPool::new(64, self.config.limits.pool_buffers, MTU);

        // Shared queues.
        let (router_packets, router_packets_rx) = mpsc::channel(self.config.limits.router_queue);
        let (tuntx, tuntx_rx) = mpsc::channel(self.config.limits.tun_queue);

        // Lifecycle plumbing: sessions publish into `events`, the publisher
        // fans out to the subscribers registered below.
        let (events, events_rx) = mpsc::channel(64);
        let (subscribe, subscribe_rx) = mpsc::channel(8);
        let (reports, reports_rx) = mpsc::channel(8);

        let (router_events, router_events_rx) = mpsc::channel(64);
        let (tracker_events, tracker_events_rx) = mpsc::channel(64);
        let (netblock_events, netblock_events_rx) = mpsc::channel(64);
        for (name, sender) in [
            ("router", router_events),
            ("tracker", tracker_events),
            ("netblock", netblock_events),
        ] {
            subscribe
                .send(Subscription { name, sender })
                .await
                .map_err(|_| Error::Shutdown)?;
        }

        let tasks = TaskTracker::new();
        tasks.spawn(publisher::publish(events_rx, subscribe_rx));
        tasks.spawn(router::route(
            router_packets_rx,
            router_events_rx,
            metrics.clone(),
        ));
        tasks.spawn(tracker::track(
            tracker_events_rx,
            reports_rx,
            metrics.clone(),
        ));
        tasks.spawn(netblock.clone().run(netblock_events_rx));

        // TUN: all queues feed the router; one writer drains the shared
        // tun-write queue.
        let tun = TunDevice::open(&self.config.tun.name, self.config.tun.queues)?;
        tun.configure(cidr.addr(), cidr.prefix_len(), MTU)?;
        for queue in tun.queues() {
            for _ in 0..self.config.tun.workers_per_queue {
                tasks.spawn(tun::tun_rx(
                    Arc::clone(queue),
                    router_packets.clone(),
                    pool.clone(),
                    shutdown.clone(),
                ));
            }
        }
        tasks.spawn(tun::tun_tx(
            Arc::clone(&tun.queues()[0]),
            tuntx_rx,
            shutdown.clone(),
        ));

        if self.config.metrics.enabled {
            let listen = self.config.metrics.listen;
            let metrics = metrics.clone();
            let reports = reports.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = metrics::serve_http(listen, metrics, reports, shutdown).await {
                    error!("metrics: http server failed: {e}");
                }
            });
        }

        let listener = TcpListener::bind(self.config.server.listen).await?;
        info!(addr = %self.config.server.listen, "server: listening");

        let (conns, mut conns_rx) = mpsc::channel(16);
        tasks.spawn(acceptor::accept(listener, conns, shutdown.clone()));

        let sessions = TaskTracker::new();
        let shared = Arc::new(SessionShared {
            acceptor,
            tuntx,
            events: events.clone(),
            netblock,
            pool,
            metrics: metrics.clone(),
            client_queue: self.config.limits.client_queue,
            handshake_timeout: self.config.server.handshake_timeout,
            shutdown: shutdown.clone(),
            tasks: sessions.clone(),
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("server: got done signal");
                    break;
                }
                conn = conns_rx.recv() => match conn {
                    None => {
                        info!("server: connection channel closed");
                        break;
                    }
                    Some((conn, peer)) => {
                        metrics.accepted.inc();
                        debug!(%peer, "server: connected");
                        sessions.spawn(session::serve(Arc::clone(&shared), conn, peer));
                    }
                },
            }
        }

        // Drain: make sure everything sees the done signal even if we left
        // the loop because the listener died.
        shutdown.cancel();

        sessions.close();
        sessions.wait().await;
        info!("server: client group done");

        // All Disconnects are published; closing the lifecycle source lets
        // the publisher finish and cascade closure downstream.
        drop(shared);
        drop(events);
        drop(router_packets);
        drop(reports);

        tasks.close();
        tasks.wait().await;
        info!("server: shutdown complete");

        Ok(())
    }
}
