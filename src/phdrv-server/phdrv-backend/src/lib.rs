// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::HashMap;
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::Duration;

use phdrv_core::{DeviceProtocol, DynResult, Link};

pub mod handler;
pub mod line;
pub mod prober;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sim;

pub use handler::HandlerProtocol;
pub use line::LineLink;
pub use prober::ProberProtocol;
pub use sim::{SimHandler, SimLink};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection details for opening a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAccess {
    Serial { path: String, baud: u32 },
    Tcp { addr: String },
    /// In-memory handler emulation.
    Sim {
        sites: Vec<String>,
        lot_size: u32,
        echo: bool,
    },
}

impl LinkAccess {
    /// Registry key of the transport.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Serial { .. } => "serial",
            Self::Tcp { .. } => "tcp",
            Self::Sim { .. } => "sim",
        }
    }
}

pub type LinkFactory = fn(LinkAccess) -> DynResult<Box<dyn Link>>;
pub type DeviceFactory = fn() -> Box<dyn DeviceProtocol>;

/// Transports and device families known to a program.
#[derive(Clone, Default)]
pub struct RegistrationContext {
    links: HashMap<String, LinkFactory>,
    devices: HashMap<String, DeviceFactory>,
}

impl RegistrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_link(&mut self, name: &str, factory: LinkFactory) {
        self.links.insert(normalize_name(name), factory);
    }

    pub fn register_device(&mut self, name: &str, factory: DeviceFactory) {
        self.devices.insert(normalize_name(name), factory);
    }

    pub fn is_link_registered(&self, name: &str) -> bool {
        self.links.contains_key(&normalize_name(name))
    }

    pub fn is_device_registered(&self, name: &str) -> bool {
        self.devices.contains_key(&normalize_name(name))
    }

    pub fn registered_links(&self) -> Vec<String> {
        sorted_keys(&self.links)
    }

    pub fn registered_devices(&self) -> Vec<String> {
        sorted_keys(&self.devices)
    }

    /// Open the transport described by `access`.
    pub fn build_link(&self, access: LinkAccess) -> DynResult<Box<dyn Link>> {
        let factory = self
            .links
            .get(access.name())
            .ok_or_else(|| format!("Unknown link type: {}", access.name()))?;
        factory(access)
    }

    pub fn build_device(&self, name: &str) -> DynResult<Box<dyn DeviceProtocol>> {
        let factory = self
            .devices
            .get(&normalize_name(name))
            .ok_or_else(|| format!("Unknown device family: {}", name))?;
        Ok(factory())
    }

    pub fn extend_from(&mut self, other: &RegistrationContext) {
        self.links
            .extend(other.links.iter().map(|(k, v)| (k.clone(), *v)));
        self.devices
            .extend(other.devices.iter().map(|(k, v)| (k.clone(), *v)));
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Register every built-in transport and device family.
pub fn register_builtin_backends_on(context: &mut RegistrationContext) {
    #[cfg(feature = "serial")]
    context.register_link("serial", serial_factory);
    context.register_link("tcp", tcp_factory);
    context.register_link("sim", sim_factory);
    context.register_device("handler", handler_factory);
    context.register_device("prober", prober_factory);
}

fn handler_factory() -> Box<dyn DeviceProtocol> {
    Box::new(HandlerProtocol::new())
}

fn prober_factory() -> Box<dyn DeviceProtocol> {
    Box::new(ProberProtocol::new())
}

#[cfg(feature = "serial")]
fn serial_factory(access: LinkAccess) -> DynResult<Box<dyn Link>> {
    match access {
        LinkAccess::Serial { path, baud } => Ok(Box::new(serial::open(&path, baud)?)),
        other => Err(format!("serial factory cannot open {:?}", other).into()),
    }
}

/// Connects synchronously; this runs once at start-up inside the runtime.
fn tcp_factory(access: LinkAccess) -> DynResult<Box<dyn Link>> {
    let addr = match access {
        LinkAccess::Tcp { addr } => addr,
        other => return Err(format!("tcp factory cannot open {:?}", other).into()),
    };
    let target = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("{} does not resolve", addr))?;
    let stream = StdTcpStream::connect_timeout(&target, TCP_CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    let stream = tokio::net::TcpStream::from_std(stream)?;
    tracing::info!("connected to {}", target);
    Ok(Box::new(LineLink::tcp(stream)))
}

fn sim_factory(access: LinkAccess) -> DynResult<Box<dyn Link>> {
    match access {
        LinkAccess::Sim {
            sites,
            lot_size,
            echo,
        } => Ok(Box::new(SimLink::new(SimHandler::new(sites, lot_size, echo)))),
        other => Err(format!("sim factory cannot open {:?}", other).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let mut context = RegistrationContext::new();
        register_builtin_backends_on(&mut context);
        assert!(context.is_device_registered("Handler"));
        assert!(context.is_device_registered("PROBER"));
        assert!(context.is_link_registered("sim"));
        assert_eq!(context.registered_devices(), vec!["handler", "prober"]);
        assert!(context.build_device("nope").is_err());

        let device = context.build_device("prober").unwrap();
        assert!(device.info().capabilities.sub_die);
    }

    #[test]
    fn test_sim_link_from_access() {
        let mut context = RegistrationContext::new();
        register_builtin_backends_on(&mut context);
        let link = context
            .build_link(LinkAccess::Sim {
                sites: vec!["1".into(), "2".into()],
                lot_size: 4,
                echo: false,
            })
            .unwrap();
        assert_eq!(link.kind(), phdrv_core::LinkKind::Gpib);
    }

    #[test]
    fn test_extend_from() {
        let mut base = RegistrationContext::new();
        let mut extra = RegistrationContext::new();
        extra.register_device("my-handler", handler_factory);
        base.extend_from(&extra);
        assert_eq!(base.registered_devices(), vec!["myhandler"]);
        assert!(base.registered_links().is_empty());
    }
}
