//! Linux kernel TUN device

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use super::TunnelInterface;
use crate::config::DeviceConfig;
use crate::error::{Error, Result};

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the write bit differently
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Largest packet read from the device in one call
const READ_BUFFER: usize = 65535;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// TUN interface driven by the tokio reactor
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    /// Create the interface (requires CAP_NET_ADMIN)
    pub fn create(name: &str) -> Result<Self> {
        let raw = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
        if raw < 0 {
            return Err(Error::Device(format!(
                "Failed to open /dev/net/tun: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: `raw` is a freshly opened descriptor owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            return Err(Error::Device(format!(
                "ioctl TUNSETIFF failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();

        Self::from_fd(fd, actual_name)
    }

    /// Switch the descriptor to non-blocking mode and register it with the reactor
    fn from_fd(fd: OwnedFd, name: String) -> Result<Self> {
        let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(Error::Device(format!(
                "Failed to set O_NONBLOCK: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?,
            name,
        })
    }

    /// Create and configure from the `[device]` section
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let device = Self::create(&config.name)?;
        device.configure(config)?;
        Ok(device)
    }

    /// Assign addresses, set the MTU and bring the link up
    pub fn configure(&self, config: &DeviceConfig) -> Result<()> {
        for cidr in [&config.ipv4_cidr, &config.ipv6_cidr].into_iter().flatten() {
            self.ip(&["addr", "add", cidr.as_str(), "dev", self.name.as_str()])?;
        }

        let mtu = config.mtu.to_string();
        if let Err(e) = self.ip(&["link", "set", "dev", self.name.as_str(), "mtu", mtu.as_str()]) {
            tracing::warn!("Failed to set MTU on {}: {}", self.name, e);
        }

        self.ip(&["link", "set", "dev", self.name.as_str(), "up"])
    }

    fn ip(&self, args: &[&str]) -> Result<()> {
        let status = std::process::Command::new("ip").args(args).status()?;
        if !status.success() {
            return Err(Error::Device(format!("`ip {}` failed with {}", args.join(" "), status)));
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelInterface for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len())
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(inner.as_raw_fd(), packet.as_ptr() as *const _, packet.len())
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    // A datagram socket keeps packet boundaries the way the TUN descriptor does
    fn device_pair() -> (TunDevice, UnixDatagram) {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let device = TunDevice::from_fd(OwnedFd::from(ours), "tuntest0".to_string()).unwrap();
        (device, theirs)
    }

    #[tokio::test]
    async fn test_packets_cross_registered_descriptor() {
        let (device, far_end) = device_pair();
        assert_eq!(device.name(), "tuntest0");

        far_end.send(b"first packet").unwrap();
        far_end.send(b"second").unwrap();
        assert_eq!(device.read_packet().await.unwrap(), b"first packet");
        assert_eq!(device.read_packet().await.unwrap(), b"second");

        assert_eq!(device.write_packet(b"outbound").await.unwrap(), 8);
        let mut buf = [0u8; 64];
        let n = far_end.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"outbound");
    }
}
