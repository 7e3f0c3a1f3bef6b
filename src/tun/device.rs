//! TUN device creation and I/O.
//!
//! Linux-only in earnest: `/dev/net/tun` with `ioctl(TUNSETIFF)`, one file
//! descriptor per queue. Other platforms get a stub that fails at open time.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Handle to an open TUN device and its queues.
pub struct TunDevice {
    name: String,
    queues: Vec<Arc<TunQueue>>,
}

impl TunDevice {
    /// Open `queues` file descriptors on the named TUN device, creating it if
    /// needed.
    ///
    /// Requires `CAP_NET_ADMIN` or root. With `queues > 1` the device is
    /// opened multi-queue.
    pub fn open(name: &str, queues: usize) -> Result<Self> {
        if queues == 0 {
            return Err(Error::InvalidConfig("need at least one TUN queue".into()));
        }

        let mut opened = Vec::with_capacity(queues);
        for _ in 0..queues {
            opened.push(Arc::new(TunQueue::open(name, queues > 1)?));
        }

        tracing::info!(name, queues, "opened TUN device");

        Ok(Self {
            name: name.to_string(),
            queues: opened,
        })
    }

    /// The open queues.
    pub fn queues(&self) -> &[Arc<TunQueue>] {
        &self.queues
    }

    /// Assign the interface address, set the MTU, bring the link up, and
    /// disable IPv6 on it.
    pub fn configure(&self, addr: Ipv4Addr, prefix: u8, mtu: usize) -> Result<()> {
        run(
            "ip",
            &["addr", "add", &format!("{addr}/{prefix}"), "dev", &self.name],
            // Re-running against a device that already carries the address is
            // not an error.
            Some("File exists"),
        )?;
        run(
            "ip",
            &["link", "set", "dev", &self.name, "mtu", &mtu.to_string()],
            None,
        )?;
        run("ip", &["link", "set", "dev", &self.name, "up"], None)?;
        run(
            "sysctl",
            &[
                "-w",
                &format!("net.ipv6.conf.{}.disable_ipv6=1", self.name),
            ],
            None,
        )?;

        tracing::info!(name = %self.name, %addr, prefix, mtu, "configured TUN device");
        Ok(())
    }
}

fn run(program: &str, args: &[&str], tolerate: Option<&str>) -> Result<()> {
    let output = std::process::Command::new(program)
        .args(args)
        .output()
        .map_err(Error::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if tolerate.is_some_and(|t| stderr.contains(t)) {
            return Ok(());
        }
        return Err(Error::Config(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub use linux::TunQueue;

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    use tokio::io::unix::AsyncFd;

    use crate::error::{Error, Result};

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

    /// One queue of a TUN device: an independent nonblocking reader/writer
    /// pair yielding whole IPv4 packets.
    pub struct TunQueue {
        fd: AsyncFd<File>,
    }

    impl TunQueue {
        pub(super) fn open(name: &str, multi_queue: bool) -> Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open("/dev/net/tun")
                .map_err(Error::Io)?;

            let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };

            // Copy name (max 15 chars + null terminator)
            let name_bytes = name.as_bytes();
            let name_len = name_bytes.len().min(15);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    name_bytes.as_ptr(),
                    ifr.ifr_name.as_mut_ptr().cast::<u8>(),
                    name_len,
                );
            }

            let mut flags = libc::IFF_TUN | libc::IFF_NO_PI;
            if multi_queue {
                flags |= libc::IFF_MULTI_QUEUE;
            }
            ifr.ifr_ifru.ifru_flags = flags as i16;

            let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) };
            if ret < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }

            let fd = AsyncFd::new(file).map_err(Error::Io)?;
            Ok(Self { fd })
        }

        /// Read one packet into `buf`, waiting for readiness.
        pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.get_ref().as_raw_fd(),
                            buf.as_mut_ptr().cast(),
                            buf.len(),
                        )
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        /// Write one packet, waiting for readiness.
        pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::write(inner.get_ref().as_raw_fd(), buf.as_ptr().cast(), buf.len())
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::TunQueue;

#[cfg(not(target_os = "linux"))]
mod stub {
    use std::io;

    use crate::error::{Error, Result};

    /// Placeholder on platforms without TUN support.
    pub struct TunQueue;

    impl TunQueue {
        pub(super) fn open(_name: &str, _multi_queue: bool) -> Result<Self> {
            Err(Error::Config(
                "TUN devices are not supported on this platform".into(),
            ))
        }

        pub async fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no TUN support"))
        }

        pub async fn write(&self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no TUN support"))
        }
    }
}
