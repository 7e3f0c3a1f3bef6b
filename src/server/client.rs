//! The authenticated client connection record and its lifecycle events.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::buffer::FrameBuf;

/// A client state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connect,
    Disconnect,
}

/// Control messages other tasks can send a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Ask the session to hang up.
    Disconnect,
}

/// State for one authenticated client connection.
///
/// Created in the session task once the TLS and application handshakes have
/// both succeeded, and shared by `Arc` with the router, tracker, and netblock
/// through lifecycle events. The record is valid between its Connect and
/// Disconnect events.
pub struct Client {
    /// Identity from the peer certificate subject.
    pub name: String,

    /// Process-unique random connection id. Distinguishes two connections
    /// from the same identity during a reconnect overlap.
    pub id: u64,

    /// Tunnel address allocated from the netblock.
    pub tunnel_ip: Ipv4Addr,

    /// Observed remote address.
    pub public_ip: IpAddr,

    pub connected_at: SystemTime,
    pub disconnected_at: RwLock<Option<SystemTime>>,

    /// Packets destined for this client go here; the session's tx pump
    /// drains it into the TLS socket. The router holds this handle via the
    /// route map between Connect and Disconnect.
    pub tx: mpsc::Sender<FrameBuf>,

    /// Asynchronous control input for the session.
    pub control: mpsc::Sender<ControlMessage>,
}

impl Client {
    /// Tunnel address as the route map key.
    pub fn tunnel_ip_u32(&self) -> u32 {
        u32::from(self.tunnel_ip)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("id", &format_args!("{:#x}", self.id))
            .field("tunnel_ip", &self.tunnel_ip)
            .field("public_ip", &self.public_ip)
            .finish()
    }
}

/// A lifecycle event: one client changed state.
///
/// Emitted exactly once per client per transition. Connect is published
/// before the session starts its rx loop; Disconnect is published only after
/// the session has stopped consuming its tx sink.
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub happened: SystemTime,
    pub transition: Transition,
    pub client: Arc<Client>,
}

impl ClientEvent {
    pub fn connect(client: Arc<Client>) -> Self {
        Self {
            happened: SystemTime::now(),
            transition: Transition::Connect,
            client,
        }
    }

    pub fn disconnect(client: Arc<Client>) -> Self {
        Self {
            happened: SystemTime::now(),
            transition: Transition::Disconnect,
            client,
        }
    }
}
