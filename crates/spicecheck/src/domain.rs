//! Domain XML for a diskless guest carrying one SPICE display
//!
//! The guest never boots anything; QEMU only has to come up far enough for
//! the SPICE server to bind its sockets.

use color_eyre::{eyre::eyre, Result};
use uuid::Uuid;

use crate::config::{ListenType, PortSetting, SpiceConfig};
use crate::xml_utils::XmlWriter;

const DEFAULT_MEMORY_MB: u64 = 128;

/// Builder for a SPICE test domain
#[derive(Debug, Default)]
pub struct DomainBuilder {
    name: Option<String>,
    memory: Option<u64>,
    spice: Option<SpiceConfig>,
    listen_address: Option<String>,
}

impl DomainBuilder {
    /// Create a new domain builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set domain name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Set memory in MiB
    pub fn with_memory(mut self, memory_mb: u64) -> Self {
        self.memory = Some(memory_mb);
        self
    }

    /// Configure the graphics device.
    ///
    /// `listen_address` is the predicted listen literal; it replaces the
    /// `valid_ipv4`/`valid_ipv6` placeholders and is only written when the
    /// scenario sets a listen address at all, so that qemu.conf applies
    /// otherwise.
    pub fn with_spice(mut self, config: &SpiceConfig, listen_address: &str) -> Self {
        self.spice = Some(config.clone());
        self.listen_address = Some(listen_address.to_owned());
        self
    }

    /// Build the domain XML
    pub fn build_xml(self) -> Result<String> {
        let name = self.name.ok_or_else(|| eyre!("Domain name is required"))?;
        let spice = self
            .spice
            .ok_or_else(|| eyre!("SPICE configuration is required"))?;
        let uuid = Uuid::new_v4().to_string();
        let memory = self.memory.unwrap_or(DEFAULT_MEMORY_MB).to_string();

        let mut writer = XmlWriter::new();
        writer.start_element("domain", &[("type", "qemu")])?;
        writer.write_text_element("name", &name)?;
        writer.write_text_element("uuid", &uuid)?;
        writer.start_element("memory", &[("unit", "MiB")])?;
        writer.write_text(&memory)?;
        writer.end_element("memory")?;
        writer.write_text_element("vcpu", "1")?;

        writer.start_element("os", &[])?;
        writer.start_element("type", &[("arch", std::env::consts::ARCH)])?;
        writer.write_text("hvm")?;
        writer.end_element("type")?;
        writer.end_element("os")?;

        writer.write_text_element("on_poweroff", "destroy")?;
        writer.write_text_element("on_reboot", "destroy")?;
        writer.write_text_element("on_crash", "destroy")?;

        writer.start_element("devices", &[])?;
        write_graphics(&mut writer, &spice, self.listen_address.as_deref())?;
        writer.start_element("video", &[])?;
        writer.write_empty_element("model", &[("type", "qxl")])?;
        writer.end_element("video")?;
        writer.end_element("devices")?;

        writer.end_element("domain")?;
        writer.into_string()
    }
}

fn port_attr(setting: PortSetting) -> Option<String> {
    match setting {
        PortSetting::NotSet => None,
        PortSetting::Value(v) => Some(v.to_string()),
    }
}

fn write_graphics(
    writer: &mut XmlWriter,
    spice: &SpiceConfig,
    listen_address: Option<&str>,
) -> Result<()> {
    let configured_listen = match spice.listen_type {
        Some(ListenType::Network) => None,
        Some(ListenType::Address) => spice.listen_address.as_ref().and(listen_address),
        None => spice.listen.as_ref().and(listen_address),
    };

    let autoport = spice.autoport.map(|t| t.to_string());
    let port = port_attr(spice.port);
    let tls_port = port_attr(spice.tls_port);
    let default_mode = spice.default_mode.map(|m| m.to_string());
    let attrs: Vec<(&str, &str)> = [
        ("type", Some("spice")),
        ("autoport", autoport.as_deref()),
        ("port", port.as_deref()),
        ("tlsPort", tls_port.as_deref()),
        ("defaultMode", default_mode.as_deref()),
        ("passwd", spice.passwd.as_deref()),
        ("listen", configured_listen.filter(|_| spice.listen_type.is_none())),
    ]
    .into_iter()
    .filter_map(|(k, v)| v.map(|v| (k, v)))
    .collect();
    writer.start_element("graphics", &attrs)?;

    match spice.listen_type {
        Some(ListenType::Network) => {
            let network = spice
                .listen_network
                .as_deref()
                .ok_or_else(|| eyre!("listen-type network requires listen-network"))?;
            writer.write_empty_element("listen", &[("type", "network"), ("network", network)])?;
        }
        Some(ListenType::Address) => match configured_listen {
            Some(address) => writer
                .write_empty_element("listen", &[("type", "address"), ("address", address)])?,
            None => writer.write_empty_element("listen", &[("type", "address")])?,
        },
        None => {}
    }

    for channel in &spice.channels {
        let mode = channel.mode.to_string();
        writer.write_empty_element(
            "channel",
            &[("name", channel.name.as_str()), ("mode", mode.as_str())],
        )?;
    }
    let children = [
        ("image", "compression", spice.image_compression.as_deref()),
        ("jpeg", "compression", spice.jpeg_compression.as_deref()),
        ("zlib", "compression", spice.zlib_compression.as_deref()),
        ("playback", "compression", spice.playback_compression.as_deref()),
        ("streaming", "mode", spice.streaming_mode.as_deref()),
        ("mouse", "mode", spice.mouse_mode.as_deref()),
    ];
    for (element, attr, value) in children {
        if let Some(value) = value {
            writer.write_empty_element(element, &[(attr, value)])?;
        }
    }
    if let Some(copy_paste) = spice.copy_paste {
        let value = copy_paste.to_string();
        writer.write_empty_element("clipboard", &[("copypaste", value.as_str())])?;
    }
    if let Some(file_transfer) = spice.file_transfer {
        let value = file_transfer.to_string();
        writer.write_empty_element("filetransfer", &[("enable", value.as_str())])?;
    }
    writer.end_element("graphics")
}
