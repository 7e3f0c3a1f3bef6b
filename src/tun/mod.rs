//! TUN virtual network interface.
//!
//! The server opens one layer-3 TUN device with several queues
//! (`IFF_MULTI_QUEUE`) so host-side packet I/O scales across tasks; the
//! client opens a single-queue device. Queues are nonblocking file
//! descriptors driven through `AsyncFd`, which keeps reads cancellable — a
//! pending TUN read no longer outlives shutdown.
//!
//! Reads and writes move whole IPv4 packets; the interface is IPv4-only and
//! IPv6 is disabled on it via sysctl.

mod device;
mod pump;

pub use device::{TunDevice, TunQueue};
pub use pump::{tun_rx, tun_tx};
