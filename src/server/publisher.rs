//! Lifecycle event fan-out.
//!
//! A single task forwards every event to every registered subscriber.
//! Registration happens-before any event the subscriber observes, because
//! both arrive over channels handled by the same task. When the event source
//! closes, the subscriber sinks are dropped in turn, which is how shutdown
//! cascades into the router, tracker, and netblock.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::server::client::ClientEvent;

/// How long a subscriber may stall the publisher. Lifecycle traffic is
/// O(connects per second), so a subscriber that cannot keep up within this
/// window is miswired, not busy.
const SEND_DEADLINE: Duration = Duration::from_secs(3);

/// A named subscriber sink.
pub struct Subscription {
    pub name: &'static str,
    pub sender: mpsc::Sender<ClientEvent>,
}

/// Run the fan-out until the event source closes.
///
/// # Panics
///
/// Panics if a subscriber fails to accept an event within the deadline, or
/// drops its receiver while the stream is still live. Both signal a wiring
/// bug that would otherwise silently break the lifecycle ordering contract.
pub async fn publish(
    mut events: mpsc::Receiver<ClientEvent>,
    mut subscribers: mpsc::Receiver<Subscription>,
) {
    let mut subs: Vec<Subscription> = Vec::new();

    debug!("publisher: starting");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("publisher: event source closed");
                    break;
                };

                for sub in &subs {
                    match sub.sender.send_timeout(event.clone(), SEND_DEADLINE).await {
                        Ok(()) => {}
                        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                            panic!("publisher: timed out sending to {}", sub.name);
                        }
                        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                            panic!("publisher: subscriber {} closed mid-stream", sub.name);
                        }
                    }
                }
            }

            Some(sub) = subscribers.recv() => {
                debug!("publisher: subscriber {}", sub.name);
                subs.push(sub);
            }
        }
    }

    // Dropping the subscriber senders closes every downstream event stream.
}
