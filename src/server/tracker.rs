//! Connection tracking.
//!
//! Enforces at-most-one authoritative connection per authenticated identity.
//! When a name reconnects while an older connection is still alive, the older
//! one is displaced into a wait table keyed by its connection id and drains
//! on its own Disconnect; the new connection becomes authoritative
//! immediately. Nothing actively tears the displaced session down — it
//! notices its socket dying or idles until the peer closes.
//!
//! The tracker also answers point-in-time snapshot requests for the
//! `/clients` endpoint through a reply channel, so reports never race the
//! tables.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::metrics::Metrics;
use crate::server::client::{Client, ClientEvent, Transition};

/// One tracked connection, as reported on `/clients`.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub time: String,
    pub name: String,
    pub ip: String,
    pub publicip: String,
    pub pending: bool,
}

/// Sink for snapshot requests: send a reply channel, receive the report.
pub type ReportSender = mpsc::Sender<oneshot::Sender<Vec<Connection>>>;

/// Run the tracker until the lifecycle event stream closes.
///
/// # Panics
///
/// Panics on a Disconnect that matches neither the wait table nor the open
/// table: under the lifecycle contract that cannot happen.
pub async fn track(
    mut events: mpsc::Receiver<ClientEvent>,
    mut reports: mpsc::Receiver<oneshot::Sender<Vec<Connection>>>,
    metrics: Arc<Metrics>,
) {
    // Authoritative connection per identity.
    let mut open: HashMap<String, Arc<Client>> = HashMap::new();
    // Displaced connections awaiting their own Disconnect.
    let mut wait: HashMap<u64, Arc<Client>> = HashMap::new();

    debug!("tracker: starting");

    loop {
        tokio::select! {
            // Events first: a snapshot must reflect every event that was
            // already queued when the request arrived.
            biased;

            event = events.recv() => {
                let Some(event) = event else {
                    debug!("tracker: event stream closed");
                    return;
                };

                match event.transition {
                    Transition::Connect => {
                        if let Some(prev) =
                            open.insert(event.client.name.clone(), event.client.clone())
                        {
                            debug!(
                                name = %prev.name,
                                id = prev.id,
                                "tracker: displacing existing connection"
                            );
                            wait.insert(prev.id, prev);
                        }
                    }
                    Transition::Disconnect => {
                        if wait.remove(&event.client.id).is_some() {
                            // A displaced connection said its goodbye.
                        } else if open
                            .get(&event.client.name)
                            .is_some_and(|c| c.id == event.client.id)
                        {
                            open.remove(&event.client.name);
                        } else {
                            panic!(
                                "tracker: no matching connection for disconnect of {} ({:#x})",
                                event.client.name, event.client.id
                            );
                        }
                    }
                }

                metrics
                    .tracked
                    .with_label_values(&["open"])
                    .set(open.len() as i64);
                metrics
                    .tracked
                    .with_label_values(&["wait"])
                    .set(wait.len() as i64);
            }

            request = reports.recv() => {
                let Some(reply) = request else {
                    debug!("tracker: report channel closed");
                    return;
                };
                let _ = reply.send(snapshot(&open, &wait));
            }
        }
    }
}

fn snapshot(open: &HashMap<String, Arc<Client>>, wait: &HashMap<u64, Arc<Client>>) -> Vec<Connection> {
    let describe = |client: &Arc<Client>, pending: bool| Connection {
        time: humantime::format_rfc3339_seconds(client.connected_at).to_string(),
        name: client.name.clone(),
        ip: client.tunnel_ip.to_string(),
        publicip: client.public_ip.to_string(),
        pending,
    };

    open.values()
        .map(|c| describe(c, false))
        .chain(wait.values().map(|c| describe(c, true)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::SystemTime;

    fn client(name: &str, last_octet: u8) -> Arc<Client> {
        let (tx, _rx) = mpsc::channel(1);
        let (control, _control_rx) = mpsc::channel(1);
        Arc::new(Client {
            name: name.into(),
            id: rand::random(),
            tunnel_ip: Ipv4Addr::new(192, 168, 0, last_octet),
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connected_at: SystemTime::now(),
            disconnected_at: parking_lot::RwLock::new(None),
            tx,
            control,
        })
    }

    struct Harness {
        events: mpsc::Sender<ClientEvent>,
        reports: ReportSender,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (report_tx, report_rx) = mpsc::channel(8);
        let task = tokio::spawn(track(event_rx, report_rx, Metrics::new().unwrap()));
        Harness {
            events: event_tx,
            reports: report_tx,
            task,
        }
    }

    async fn report(h: &Harness) -> Vec<Connection> {
        let (tx, rx) = oneshot::channel();
        h.reports.send(tx).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn reconnect_displaces_then_drains() {
        let h = start();

        let first = client("alice", 2);
        let second = client("alice", 3);

        h.events
            .send(ClientEvent::connect(first.clone()))
            .await
            .unwrap();
        h.events
            .send(ClientEvent::connect(second.clone()))
            .await
            .unwrap();

        // Overlap: two entries, the displaced one pending.
        let list = report(&h).await;
        assert_eq!(list.len(), 2);
        let pending: Vec<_> = list.iter().filter(|c| c.pending).collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ip, "192.168.0.2");

        // The displaced connection finally disconnects; the second remains
        // authoritative.
        h.events
            .send(ClientEvent::disconnect(first))
            .await
            .unwrap();
        let list = report(&h).await;
        assert_eq!(list.len(), 1);
        assert!(!list[0].pending);
        assert_eq!(list[0].ip, "192.168.0.3");

        h.events
            .send(ClientEvent::disconnect(second))
            .await
            .unwrap();
        let list = report(&h).await;
        assert!(list.is_empty());

        drop(h.events);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn plain_connect_disconnect_cycle() {
        let h = start();
        let c = client("bob", 4);

        h.events.send(ClientEvent::connect(c.clone())).await.unwrap();
        let list = report(&h).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "bob");
        assert_eq!(list[0].publicip, "127.0.0.1");

        h.events.send(ClientEvent::disconnect(c)).await.unwrap();
        assert!(report(&h).await.is_empty());

        drop(h.events);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn unmatched_disconnect_panics() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (_report_tx, report_rx) = mpsc::channel(8);
        let task = tokio::spawn(track(event_rx, report_rx, Metrics::new().unwrap()));

        event_tx
            .send(ClientEvent::disconnect(client("ghost", 9)))
            .await
            .unwrap();

        assert!(task.await.unwrap_err().is_panic());
    }
}
