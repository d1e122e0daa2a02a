//! libvirt virtual networks used as a SPICE listen source
//!
//! With `<listen type='network'>` libvirt binds to the address of the named
//! network. Tests create a transient network, read its address back from
//! `virsh net-dumpxml`, and destroy it afterwards.

use std::io::Write;
use std::net::Ipv4Addr;
use std::process::Command;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, info};

use crate::address::IpAddress;
use crate::cmdext::CommandRunExt;
use crate::xml_utils::{parse_xml_dom, XmlWriter};

/// A `virsh` command, optionally against a specific libvirt URI
pub fn virsh_command(connect_uri: Option<&str>) -> Command {
    let mut cmd = Command::new("virsh");
    if let Some(uri) = connect_uri {
        cmd.arg("-c").arg(uri);
    }
    cmd
}

/// Definition of an isolated IPv4 network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Network name
    pub name: String,
    /// Bridge device libvirt creates
    pub bridge: String,
    /// Host side address of the bridge
    pub address: Ipv4Addr,
    /// Prefix length of the network
    pub prefix: u8,
}

/// Render `spec` as libvirt network XML
pub fn network_xml(spec: &NetworkSpec) -> Result<String> {
    let address = spec.address.to_string();
    let prefix = spec.prefix.to_string();
    let mut writer = XmlWriter::new();
    writer.start_element("network", &[])?;
    writer.write_text_element("name", &spec.name)?;
    writer.write_empty_element(
        "bridge",
        &[("name", spec.bridge.as_str()), ("stp", "on"), ("delay", "0")],
    )?;
    writer.write_empty_element("ip", &[("address", address.as_str()), ("prefix", prefix.as_str())])?;
    writer.end_element("network")?;
    writer.into_string()
}

/// Address of the first `<ip>` of a network definition
pub fn ip_from_network_xml(xml: &str) -> Result<IpAddress> {
    let dom = parse_xml_dom(xml)?;
    dom.find_all("ip")
        .into_iter()
        .find_map(|ip| ip.attr("address"))
        .map(IpAddress::parse)
        .ok_or_else(|| eyre!("Network definition has no <ip address=...>"))
}

/// A libvirt network, possibly created by us
#[derive(Debug)]
pub struct VirtualNetwork {
    name: String,
    connect_uri: Option<String>,
}

impl VirtualNetwork {
    /// Refer to an existing network
    pub fn lookup(name: &str, connect_uri: Option<&str>) -> Self {
        Self {
            name: name.to_owned(),
            connect_uri: connect_uri.map(ToOwned::to_owned),
        }
    }

    /// Create a transient network; it disappears on [`VirtualNetwork::destroy`]
    pub fn create_transient(spec: &NetworkSpec, connect_uri: Option<&str>) -> Result<Self> {
        let xml = network_xml(spec)?;
        let mut file = tempfile::Builder::new()
            .prefix("spicecheck-net-")
            .suffix(".xml")
            .tempfile()
            .context("Failed to create network XML file")?;
        file.write_all(xml.as_bytes())
            .context("Failed to write network XML")?;
        virsh_command(connect_uri)
            .arg("net-create")
            .arg(file.path())
            .run()
            .with_context(|| format!("Failed to create network {}", spec.name))?;
        info!("Created transient network {}", spec.name);
        Ok(Self::lookup(&spec.name, connect_uri))
    }

    /// Network name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn virsh(&self) -> Command {
        virsh_command(self.connect_uri.as_deref())
    }

    /// The address libvirt binds for `<listen type='network'>`
    pub fn listen_ip(&self) -> Result<IpAddress> {
        let xml = self
            .virsh()
            .args(["net-dumpxml", self.name.as_str()])
            .run_get_string()
            .with_context(|| format!("Failed to dump network {}", self.name))?;
        let ip = ip_from_network_xml(&xml)
            .with_context(|| format!("Reading address of network {}", self.name))?;
        debug!("Network {} listens on {ip}", self.name);
        Ok(ip)
    }

    /// Tear the network down
    pub fn destroy(self) -> Result<()> {
        self.virsh()
            .args(["net-destroy", self.name.as_str()])
            .run()
            .with_context(|| format!("Failed to destroy network {}", self.name))?;
        info!("Destroyed network {}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use similar_asserts::assert_eq;

    #[test]
    fn test_network_xml_roundtrip() {
        let spec = NetworkSpec {
            name: "spicecheck-test".into(),
            bridge: "virbr-spice0".into(),
            address: Ipv4Addr::new(192, 168, 150, 1),
            prefix: 24,
        };
        let xml = network_xml(&spec).unwrap();
        assert!(xml.contains("<name>spicecheck-test</name>"));
        assert!(xml.contains(r#"<bridge name="virbr-spice0" stp="on" delay="0"/>"#));
        assert_eq!(
            ip_from_network_xml(&xml).unwrap(),
            IpAddress::parse("192.168.150.1")
        );
    }

    #[test]
    fn test_ip_from_dumpxml() {
        let xml = indoc! {"
            <network connections='1'>
              <name>default</name>
              <forward mode='nat'>
                <nat>
                  <port start='1024' end='65535'/>
                </nat>
              </forward>
              <bridge name='virbr0' stp='on' delay='0'/>
              <mac address='52:54:00:6b:3c:58'/>
              <ip address='192.168.122.1' netmask='255.255.255.0'>
                <dhcp>
                  <range start='192.168.122.2' end='192.168.122.254'/>
                </dhcp>
              </ip>
            </network>
        "};
        assert_eq!(
            ip_from_network_xml(xml).unwrap(),
            IpAddress::parse("192.168.122.1")
        );
        assert!(ip_from_network_xml("<network><name>x</name></network>").is_err());
    }
}
