/*
Copyright 2024 The lxe Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Device model of the container manager: disks, block devices and proxy
//! (userspace port forward) devices attached to sandboxes and containers.

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// One side of a proxy device, `<protocol>:<address>:<port>` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub protocol: Protocol,
    pub address: String,
    pub port: i32,
}

impl Display for ProxyEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.protocol.as_str(), self.address, self.port)
    }
}

/// A filesystem mount into the instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disk {
    /// Mount path inside the instance. `/` selects the root disk.
    pub path: String,
    /// Host source path. Empty for the root disk.
    pub source: String,
    pub readonly: bool,
    pub optional: bool,
    /// Storage pool backing the root disk.
    pub pool: String,
}

/// A host block device mapped into the instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    pub source: String,
    pub path: String,
}

/// A userspace forwarder from a host endpoint to an instance endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub listen: ProxyEndpoint,
    pub destination: ProxyEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Disk(Disk),
    Block(Block),
    Proxy(Proxy),
}

impl Device {
    /// Identity of the device within its owner. Writing a device with an
    /// existing key replaces the previous one.
    pub fn key(&self) -> String {
        match self {
            Device::Disk(d) => format!("disk-{}", d.path),
            Device::Block(b) => format!("block-{}", b.path),
            Device::Proxy(p) => format!("proxy-{}", p.listen),
        }
    }
}

/// Device set keyed by [`Device::key`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Devices(Vec<Device>);

impl Devices {
    pub fn upsert(&mut self, device: Device) {
        let key = device.key();
        if let Some(existing) = self.0.iter_mut().find(|d| d.key() == key) {
            *existing = device;
        } else {
            self.0.push(device);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn proxies(&self) -> impl Iterator<Item = &Proxy> {
        self.0.iter().filter_map(|d| match d {
            Device::Proxy(p) => Some(p),
            _ => None,
        })
    }

    pub fn disks(&self) -> impl Iterator<Item = &Disk> {
        self.0.iter().filter_map(|d| match d {
            Device::Disk(d) => Some(d),
            _ => None,
        })
    }
}

impl<'a> IntoIterator for &'a Devices {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_endpoint_format() {
        let ep = ProxyEndpoint {
            protocol: Protocol::Udp,
            address: "0.0.0.0".to_string(),
            port: 53,
        };
        assert_eq!(ep.to_string(), "udp:0.0.0.0:53");
    }

    #[test]
    fn test_upsert_replaces_by_key() {
        let mut devices = Devices::default();
        devices.upsert(Device::Disk(Disk {
            path: "/".to_string(),
            pool: "default".to_string(),
            ..Default::default()
        }));
        devices.upsert(Device::Disk(Disk {
            path: "/".to_string(),
            readonly: true,
            pool: "default".to_string(),
            ..Default::default()
        }));
        assert_eq!(devices.len(), 1);
        assert!(devices.disks().next().unwrap().readonly);
    }

    #[test]
    fn test_upsert_keeps_distinct_keys() {
        let mut devices = Devices::default();
        devices.upsert(Device::Block(Block {
            source: "/dev/sda".to_string(),
            path: "/dev/xda".to_string(),
        }));
        devices.upsert(Device::Disk(Disk {
            path: "/dev/xda".to_string(),
            ..Default::default()
        }));
        assert_eq!(devices.len(), 2);
    }
}
