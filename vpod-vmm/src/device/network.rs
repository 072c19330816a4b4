//! Pod bridge and tap interface management.
//!
//! The daemon maintains one bridge with a private IPv4 range. Each pod
//! interface is a kernel tap attached to that bridge; the tap's fd is handed
//! to the hypervisor so the VM's NIC is bound to it. Addresses come from an
//! internal allocator over the bridge subnet.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;

use ipnet::Ipv4Net;
use libc::{IFNAMSIZ, c_char, c_short};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::DeviceError;

const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

/// An allocated tap: the open fd, the kernel-assigned interface name, and
/// the address handed to the guest.
pub struct TapDevice {
    pub file: File,
    pub name: String,
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

/// Process-wide bridge + address allocator. Constructed once at daemon start
/// and passed to every VM explicitly.
pub struct NetworkPool {
    bridge: String,
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    in_use: Mutex<HashSet<Ipv4Addr>>,
}

impl NetworkPool {
    /// Ensure the bridge exists with the gateway address, and bring it up.
    pub async fn init(bridge: &str, cidr: &str) -> Result<Self, DeviceError> {
        let subnet: Ipv4Net = cidr
            .parse()
            .map_err(|e| DeviceError::Config(format!("bad bridge cidr {cidr}: {e}")))?;
        let gateway = first_host(&subnet)
            .ok_or_else(|| DeviceError::Config(format!("subnet {cidr} has no usable host")))?;

        let pool = Self {
            bridge: bridge.to_string(),
            subnet,
            gateway,
            in_use: Mutex::new(HashSet::from([gateway])),
        };
        pool.ensure_bridge().await?;
        Ok(pool)
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    async fn ensure_bridge(&self) -> Result<(), DeviceError> {
        let exists = Command::new("ip")
            .args(["link", "show", &self.bridge])
            .output()
            .await?
            .status
            .success();

        if !exists {
            info!(bridge = %self.bridge, "creating bridge");
            run_ip(&["link", "add", &self.bridge, "type", "bridge"]).await?;
        }

        let addr = format!("{}/{}", self.gateway, self.subnet.prefix_len());
        run_ip(&["addr", "replace", &addr, "dev", &self.bridge]).await?;
        run_ip(&["link", "set", &self.bridge, "up"]).await?;

        info!(bridge = %self.bridge, subnet = %self.subnet, "bridge up");
        Ok(())
    }

    /// Reserve an address. An explicit request fails if the address is
    /// outside the subnet or already taken.
    pub fn request_ip(&self, requested: Option<Ipv4Addr>) -> Result<Ipv4Addr, DeviceError> {
        let mut in_use = self.in_use.lock().unwrap();
        if let Some(ip) = requested {
            if !self.subnet.contains(&ip) || ip == self.subnet.network() || ip == self.subnet.broadcast() {
                return Err(DeviceError::Config(format!(
                    "{ip} is not a usable address in {}",
                    self.subnet
                )));
            }
            if !in_use.insert(ip) {
                return Err(DeviceError::Config(format!("{ip} is already allocated")));
            }
            return Ok(ip);
        }
        for ip in self.subnet.hosts() {
            if in_use.insert(ip) {
                return Ok(ip);
            }
        }
        Err(DeviceError::PoolExhausted(self.subnet.to_string()))
    }

    pub fn release_ip(&self, ip: Ipv4Addr) {
        if ip == self.gateway {
            return;
        }
        self.in_use.lock().unwrap().remove(&ip);
    }

    /// Open a tap on `/dev/net/tun`, attach it to the bridge, bring it up.
    /// The kernel picks the interface name. Failure releases the address.
    pub async fn allocate_tap(&self, requested: Option<Ipv4Addr>) -> Result<TapDevice, DeviceError> {
        let ip = self.request_ip(requested)?;
        match self.open_and_attach().await {
            Ok((file, name)) => {
                info!(tap = %name, %ip, bridge = %self.bridge, "tap allocated");
                Ok(TapDevice {
                    file,
                    name,
                    ip,
                    prefix_len: self.subnet.prefix_len(),
                    gateway: self.gateway,
                })
            }
            Err(e) => {
                self.release_ip(ip);
                Err(e)
            }
        }
    }

    async fn open_and_attach(&self) -> Result<(File, String), DeviceError> {
        // Dropping the file on an error path destroys the non-persistent tap.
        let (file, name) = open_tap()?;
        run_ip(&["link", "set", &name, "master", &self.bridge]).await?;
        run_ip(&["link", "set", &name, "up"]).await?;
        Ok((file, name))
    }
}

/// TUNSETIFF with an empty name: the kernel assigns the next free tapN and
/// writes it back into the request.
fn open_tap() -> Result<(File, String), DeviceError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")?;

    let mut req = IfReq {
        ifr_name: [0; IFNAMSIZ],
        ifr_flags: (libc::IFF_TAP | libc::IFF_NO_PI) as c_short,
        _padding: [0; 22],
    };

    let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut req) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let name: String = req
        .ifr_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8 as char)
        .collect();
    debug!(tap = %name, "tap device opened");
    Ok((file, name))
}

async fn run_ip(args: &[&str]) -> Result<(), DeviceError> {
    let output = Command::new("ip").args(args).output().await?;
    if !output.status.success() {
        return Err(DeviceError::Command {
            command: format!("ip {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

fn first_host(subnet: &Ipv4Net) -> Option<Ipv4Addr> {
    subnet.hosts().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> NetworkPool {
        let subnet: Ipv4Net = cidr.parse().unwrap();
        let gateway = first_host(&subnet).unwrap();
        NetworkPool {
            bridge: "vpod0".to_string(),
            subnet,
            gateway,
            in_use: Mutex::new(HashSet::from([gateway])),
        }
    }

    #[test]
    fn allocates_distinct_addresses() {
        let pool = pool("10.11.0.0/29");
        let a = pool.request_ip(None).unwrap();
        let b = pool.request_ip(None).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, pool.gateway());
        assert!(pool.subnet().contains(&a));
    }

    #[test]
    fn released_address_is_reusable() {
        let pool = pool("10.11.0.0/30");
        // /30 leaves one usable host beyond the gateway.
        let a = pool.request_ip(None).unwrap();
        assert!(pool.request_ip(None).is_err());
        pool.release_ip(a);
        assert_eq!(pool.request_ip(None).unwrap(), a);
    }

    #[test]
    fn explicit_request_honored_and_conflicts_rejected() {
        let pool = pool("10.11.0.0/24");
        let want: Ipv4Addr = "10.11.0.42".parse().unwrap();
        assert_eq!(pool.request_ip(Some(want)).unwrap(), want);
        assert!(pool.request_ip(Some(want)).is_err());
        let outside: Ipv4Addr = "10.12.0.2".parse().unwrap();
        assert!(pool.request_ip(Some(outside)).is_err());
    }

    #[test]
    fn gateway_is_never_released() {
        let pool = pool("10.11.0.0/24");
        let gw = pool.gateway();
        pool.release_ip(gw);
        assert!(pool.request_ip(Some(gw)).is_err());
    }
}
