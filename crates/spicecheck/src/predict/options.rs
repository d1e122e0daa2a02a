//! Expected `-spice` options of the QEMU command line

use std::collections::BTreeMap;

use crate::config::{EnvState, SpiceConfig, Toggle};

use super::listen::Listen;
use super::ports::Ports;

/// Value QEMU reports for a bare flag
pub const FLAG_ON: &str = "on";
const FLAG_OFF: &str = "off";

fn flag(enabled: bool) -> String {
    if enabled { FLAG_ON } else { FLAG_OFF }.to_owned()
}

/// Map the scenario to the `key=value` pairs libvirt passes to `-spice`.
///
/// Channel routing and the password are not part of the result; channels
/// are compared separately and the password travels as a secret object.
pub fn expected_options(
    config: &SpiceConfig,
    env: &EnvState,
    listen: &Listen,
    ports: &Ports,
) -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        options.insert(key.to_owned(), value);
    };

    if let Some(port) = ports.port {
        set("port", port.to_string());
    }
    if let Some(port) = ports.tls_port {
        set("tls-port", port.to_string());
        set(
            "x509-dir",
            env.qemu_conf.spice_tls_x509_cert_dir.to_string(),
        );
    }
    set("addr", listen.listen_address.clone());

    let has_password = config.passwd.is_some() || env.qemu_conf.spice_password.is_some();
    if !has_password {
        set("disable-ticketing", FLAG_ON.to_owned());
    }

    if let Some(v) = &config.image_compression {
        set("image-compression", v.clone());
    }
    if let Some(v) = &config.jpeg_compression {
        set("jpeg-wan-compression", v.clone());
    }
    if let Some(v) = &config.zlib_compression {
        set("zlib-glz-wan-compression", v.clone());
    }
    if let Some(v) = &config.playback_compression {
        set("playback-compression", v.clone());
    }
    if let Some(v) = &config.streaming_mode {
        set("streaming-video", v.clone());
    }
    if let Some(mode) = &config.mouse_mode {
        set("agent-mouse", flag(mode == "client"));
    }
    if config.copy_paste == Some(Toggle::No) {
        set("disable-copy-paste", FLAG_ON.to_owned());
    }
    if config.file_transfer == Some(Toggle::No) {
        set("disable-agent-file-xfer", FLAG_ON.to_owned());
    }
    set("seamless-migration", FLAG_ON.to_owned());
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::IpAddress;
    use crate::config::QemuConf;
    use similar_asserts::assert_eq;

    fn env() -> EnvState {
        EnvState {
            qemu_conf: QemuConf {
                spice_tls: true,
                ..Default::default()
            },
            certs_available: true,
        }
    }

    fn listen(addr: &str) -> Listen {
        Listen {
            expected_ips: vec![IpAddress::parse(addr)],
            listen_address: addr.to_owned(),
        }
    }

    fn render(options: &BTreeMap<String, String>) -> Vec<String> {
        options.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    #[test]
    fn test_minimal() {
        let ports = Ports {
            port: Some(5900),
            tls_port: None,
        };
        let options = expected_options(&SpiceConfig::default(), &env(), &listen("127.0.0.1"), &ports);
        assert_eq!(
            render(&options),
            vec![
                "addr=127.0.0.1",
                "disable-ticketing=on",
                "port=5900",
                "seamless-migration=on"
            ]
        );
    }

    #[test]
    fn test_tls_and_extras() {
        let config = SpiceConfig {
            passwd: Some("hunter2".into()),
            image_compression: Some("auto_glz".into()),
            jpeg_compression: Some("never".into()),
            zlib_compression: Some("always".into()),
            playback_compression: Some("off".into()),
            streaming_mode: Some("filter".into()),
            mouse_mode: Some("server".into()),
            copy_paste: Some(Toggle::No),
            file_transfer: Some(Toggle::Yes),
            ..Default::default()
        };
        let ports = Ports {
            port: None,
            tls_port: Some(5901),
        };
        let options = expected_options(&config, &env(), &listen("::1"), &ports);
        assert_eq!(
            render(&options),
            vec![
                "addr=::1",
                "agent-mouse=off",
                "disable-copy-paste=on",
                "image-compression=auto_glz",
                "jpeg-wan-compression=never",
                "playback-compression=off",
                "seamless-migration=on",
                "streaming-video=filter",
                "tls-port=5901",
                "x509-dir=/etc/pki/libvirt-spice",
                "zlib-glz-wan-compression=always",
            ]
        );
    }

    #[test]
    fn test_qemu_conf_password_enables_ticketing() {
        let mut env = env();
        env.qemu_conf.spice_password = Some("secret".into());
        let options = expected_options(
            &SpiceConfig::default(),
            &env,
            &listen("127.0.0.1"),
            &Ports::default(),
        );
        assert!(!options.contains_key("disable-ticketing"));
    }
}
