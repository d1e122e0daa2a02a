//! Scenario configuration
//!
//! A scenario is described by a TOML file with a `[spice]` table holding the
//! graphics device knobs, and optional `[qemu-conf]` and `[env]` tables that
//! override what would otherwise be read from the host. Every knob may be
//! omitted or spelled `"not_set"`.
//!
//! ```toml
//! [spice]
//! default-mode = "any"
//! channels = "main:secure display:insecure"
//! port = -1
//! tls-port = "not_set"
//! autoport = "yes"
//! listen-type = "address"
//! listen-address = "0.0.0.0"
//! ```

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{bail, eyre, Context};
use color_eyre::{Report, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, trace};

use crate::allocator::{DEFAULT_PORT_MAX, DEFAULT_PORT_MIN};

/// Spelling used throughout scenario files for "no value"
pub const NOT_SET: &str = "not_set";

/// Location of the host's QEMU driver configuration
pub const QEMU_CONF_PATH: &str = "/etc/libvirt/qemu.conf";

/// libvirt's default SPICE certificate directory
pub const DEFAULT_SPICE_CERT_DIR: &str = "/etc/pki/libvirt-spice";

/// Graphics-level `defaultMode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DefaultMode {
    /// Every channel defaults to TLS
    Secure,
    /// Every channel defaults to plaintext
    Insecure,
    /// Channels may use either
    Any,
}

/// Per-channel `mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ChannelMode {
    /// TLS only
    Secure,
    /// Plaintext only
    Insecure,
}

/// A libvirt `yes`/`no` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Toggle {
    /// `yes`
    Yes,
    /// `no`
    No,
}

/// How the listen address is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ListenType {
    /// A literal address
    Address,
    /// The address of a named virtual network
    Network,
}

/// One `<channel name=... mode=...>` override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOverride {
    /// Channel name (`main`, `display`, `inputs`, ...)
    pub name: String,
    /// Required security mode
    pub mode: ChannelMode,
}

impl FromStr for ChannelOverride {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self> {
        let (name, mode) = s.split_once(':').ok_or_else(|| {
            eyre!("Invalid channel override '{s}'. Expected format: name:secure or name:insecure")
        })?;
        let name = name.trim();
        if name.is_empty() {
            bail!("Invalid channel override '{s}': empty channel name");
        }
        let mode = mode
            .trim()
            .parse::<ChannelMode>()
            .map_err(|_| eyre!("Invalid channel mode '{mode}' in '{s}'"))?;
        Ok(Self {
            name: name.to_owned(),
            mode,
        })
    }
}

impl fmt::Display for ChannelOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.mode)
    }
}

/// Parse a whitespace or comma separated list of `name:mode` overrides
pub fn parse_channels(s: &str) -> Result<Vec<ChannelOverride>> {
    s.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

/// A port attribute as written in the scenario.
///
/// Unusual values (`-1`, `0`, negative, above 65535) are kept verbatim since
/// predicting how libvirt reacts to them is the point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortSetting {
    /// Attribute absent
    #[default]
    NotSet,
    /// Attribute present with this value
    Value(i64),
}

impl PortSetting {
    /// The effective value; `0` is the same as not set
    pub fn resolve(self) -> Option<i64> {
        match self {
            PortSetting::NotSet | PortSetting::Value(0) => None,
            PortSetting::Value(v) => Some(v),
        }
    }
}

impl From<Option<i64>> for PortSetting {
    fn from(value: Option<i64>) -> Self {
        value.map_or(PortSetting::NotSet, PortSetting::Value)
    }
}

impl FromStr for PortSetting {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == NOT_SET {
            return Ok(PortSetting::NotSet);
        }
        s.parse::<i64>()
            .map(PortSetting::Value)
            .map_err(|_| eyre!("Invalid port '{s}'. Expected an integer or '{NOT_SET}'"))
    }
}

impl fmt::Display for PortSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSetting::NotSet => f.write_str(NOT_SET),
            PortSetting::Value(v) => write!(f, "{v}"),
        }
    }
}

impl<'de> Deserialize<'de> for PortSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(i64),
            Str(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Int(v) => Ok(PortSetting::Value(v)),
            Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for PortSetting {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn optional_setting<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match Option::<String>::deserialize(deserializer)?.as_deref() {
        None | Some(NOT_SET) => Ok(None),
        Some(s) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

fn optional_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| s != NOT_SET))
}

fn channel_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<ChannelOverride>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        One(String),
        Many(Vec<String>),
    }
    let joined = match Repr::deserialize(deserializer)? {
        Repr::One(s) => s,
        Repr::Many(v) => v.join(" "),
    };
    if joined == NOT_SET {
        return Ok(Vec::new());
    }
    parse_channels(&joined).map_err(serde::de::Error::custom)
}

/// Graphics device configuration of one scenario
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SpiceConfig {
    /// `defaultMode`
    #[serde(default, deserialize_with = "optional_setting")]
    pub default_mode: Option<DefaultMode>,
    /// Per-channel mode overrides, in document order
    #[serde(default, deserialize_with = "channel_list")]
    pub channels: Vec<ChannelOverride>,
    /// Plaintext `port`
    #[serde(default)]
    pub port: PortSetting,
    /// `tlsPort`
    #[serde(default)]
    pub tls_port: PortSetting,
    /// `autoport`
    #[serde(default, deserialize_with = "optional_setting")]
    pub autoport: Option<Toggle>,
    /// `<listen type=...>`
    #[serde(default, deserialize_with = "optional_setting")]
    pub listen_type: Option<ListenType>,
    /// Graphics `listen` attribute; also accepts `valid_ipv4`/`valid_ipv6`
    #[serde(default, deserialize_with = "optional_string")]
    pub listen: Option<String>,
    /// `<listen type='address' address=...>`
    #[serde(default, deserialize_with = "optional_string")]
    pub listen_address: Option<String>,
    /// `<listen type='network' network=...>`
    #[serde(default, deserialize_with = "optional_string")]
    pub listen_network: Option<String>,
    /// `passwd`
    #[serde(default, deserialize_with = "optional_string")]
    pub passwd: Option<String>,
    /// `<image compression=...>`
    #[serde(default, deserialize_with = "optional_string")]
    pub image_compression: Option<String>,
    /// `<jpeg compression=...>`
    #[serde(default, deserialize_with = "optional_string")]
    pub jpeg_compression: Option<String>,
    /// `<zlib compression=...>`
    #[serde(default, deserialize_with = "optional_string")]
    pub zlib_compression: Option<String>,
    /// `<playback compression=...>` (`on`/`off`)
    #[serde(default, deserialize_with = "optional_string")]
    pub playback_compression: Option<String>,
    /// `<streaming mode=...>`
    #[serde(default, deserialize_with = "optional_string")]
    pub streaming_mode: Option<String>,
    /// `<mouse mode=...>` (`client`/`server`)
    #[serde(default, deserialize_with = "optional_string")]
    pub mouse_mode: Option<String>,
    /// `<clipboard copypaste=...>`
    #[serde(default, deserialize_with = "optional_setting")]
    pub copy_paste: Option<Toggle>,
    /// `<filetransfer enable=...>`
    #[serde(default, deserialize_with = "optional_setting")]
    pub file_transfer: Option<Toggle>,
}

impl SpiceConfig {
    /// Whether graphics-level `autoport='yes'` is set
    pub fn autoport(&self) -> bool {
        self.autoport == Some(Toggle::Yes)
    }

    /// Whether `defaultMode='any'` is set
    pub fn any_mode(&self) -> bool {
        self.default_mode == Some(DefaultMode::Any)
    }
}

/// The SPICE-related subset of qemu.conf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct QemuConf {
    /// `spice_tls = 1`
    pub spice_tls: bool,
    /// `spice_tls_x509_cert_dir`, falling back to `default_tls_x509_cert_dir`
    pub spice_tls_x509_cert_dir: Utf8PathBuf,
    /// `spice_listen`
    pub spice_listen: Option<String>,
    /// `spice_password`
    pub spice_password: Option<String>,
    /// `remote_display_port_min`
    pub remote_display_port_min: u16,
    /// `remote_display_port_max`
    pub remote_display_port_max: u16,
}

impl Default for QemuConf {
    fn default() -> Self {
        Self {
            spice_tls: false,
            spice_tls_x509_cert_dir: Utf8PathBuf::from(DEFAULT_SPICE_CERT_DIR),
            spice_listen: None,
            spice_password: None,
            remote_display_port_min: DEFAULT_PORT_MIN,
            remote_display_port_max: DEFAULT_PORT_MAX,
        }
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_port_value(key: &str, value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .with_context(|| format!("Invalid {key} value '{value}'"))
}

impl QemuConf {
    /// Parse qemu.conf text; unrelated keys are ignored
    pub fn parse(content: &str) -> Result<Self> {
        let mut conf = QemuConf::default();
        let mut spice_dir = None;
        let mut default_dir = None;
        // Inside a list value spanning several lines, such as cgroup_device_acl
        let mut in_list = false;
        for line in content.lines() {
            let line = strip_comment(line).trim();
            if line.is_empty() {
                continue;
            }
            if in_list {
                in_list = !line.contains(']');
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("Malformed qemu.conf line: {line:?}");
            };
            let key = key.trim();
            let value = value.trim();
            if value.starts_with('[') {
                in_list = !value.contains(']');
                trace!("Skipping list value of {key}");
                continue;
            }
            let value = unquote(value);
            match key {
                "spice_tls" => conf.spice_tls = value == "1",
                "spice_tls_x509_cert_dir" => spice_dir = Some(Utf8PathBuf::from(value)),
                "default_tls_x509_cert_dir" => default_dir = Some(Utf8PathBuf::from(value)),
                "spice_listen" => conf.spice_listen = Some(value.to_owned()),
                "spice_password" => conf.spice_password = Some(value.to_owned()),
                "remote_display_port_min" => {
                    conf.remote_display_port_min = parse_port_value(key, value)?
                }
                "remote_display_port_max" => {
                    conf.remote_display_port_max = parse_port_value(key, value)?
                }
                _ => trace!("Ignoring qemu.conf key {key}"),
            }
        }
        if let Some(dir) = spice_dir.or(default_dir) {
            conf.spice_tls_x509_cert_dir = dir;
        }
        if conf.remote_display_port_min > conf.remote_display_port_max {
            bail!(
                "remote_display_port_min ({}) is above remote_display_port_max ({})",
                conf.remote_display_port_min,
                conf.remote_display_port_max
            );
        }
        Ok(conf)
    }

    /// Load qemu.conf from `path`; a missing file means libvirt defaults
    pub fn load(path: &Utf8Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                Self::parse(&content).with_context(|| format!("Failed to parse {path}"))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{path} not found, using libvirt defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {path}")),
        }
    }
}

/// Host state a scenario's outcome depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvState {
    /// SPICE settings of the QEMU driver
    pub qemu_conf: QemuConf,
    /// Whether the SPICE certificate directory holds a usable set
    pub certs_available: bool,
}

impl EnvState {
    /// Resolve certificate availability by inspecting the configured directory
    pub fn probe(qemu_conf: QemuConf) -> Self {
        let certs_available = crate::tls::certs_available(&qemu_conf.spice_tls_x509_cert_dir);
        Self {
            qemu_conf,
            certs_available,
        }
    }

    /// Whether qemu.conf enables SPICE TLS
    pub fn tls_enabled(&self) -> bool {
        self.qemu_conf.spice_tls
    }
}

/// Overrides for host state, mostly useful when predicting offline
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EnvOverrides {
    /// Skip inspecting the certificate directory
    pub certs_available: Option<bool>,
}

/// A scenario file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Scenario {
    /// Graphics device configuration
    #[serde(default)]
    pub spice: SpiceConfig,
    /// Replaces the host's qemu.conf when present
    pub qemu_conf: Option<QemuConf>,
    /// Host state overrides
    #[serde(default)]
    pub env: EnvOverrides,
}

impl Scenario {
    /// Load a scenario from a TOML file
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file: {path}"))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse scenario file: {path}"))
    }

    /// Combine the scenario with the host's qemu.conf
    pub fn env_state(&self, host_conf: QemuConf) -> EnvState {
        let qemu_conf = self.qemu_conf.clone().unwrap_or(host_conf);
        match self.env.certs_available {
            Some(certs_available) => EnvState {
                qemu_conf,
                certs_available,
            },
            None => EnvState::probe(qemu_conf),
        }
    }
}
