//! Which channels must use TLS and which must use plaintext

use serde::{Deserialize, Serialize};

use crate::config::{ChannelMode, ChannelOverride, DefaultMode};

/// Name QEMU uses for "every channel not listed explicitly"
pub const DEFAULT_CHANNEL: &str = "default";

/// Channel names routed to each transport, in configuration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channels {
    /// Channels passed as `tls-channel=`
    pub tls: Vec<String>,
    /// Channels passed as `plaintext-channel=`
    pub plaintext: Vec<String>,
}

/// Map `defaultMode` and the per-channel overrides to channel lists.
///
/// Duplicates are kept; QEMU resolves them, not us.
pub fn expected_channels(
    default_mode: Option<DefaultMode>,
    overrides: &[ChannelOverride],
) -> Channels {
    let mut channels = Channels::default();
    match default_mode {
        Some(DefaultMode::Secure) => channels.tls.push(DEFAULT_CHANNEL.to_owned()),
        Some(DefaultMode::Insecure) => channels.plaintext.push(DEFAULT_CHANNEL.to_owned()),
        Some(DefaultMode::Any) | None => {}
    }
    for channel in overrides {
        match channel.mode {
            ChannelMode::Secure => channels.tls.push(channel.name.clone()),
            ChannelMode::Insecure => channels.plaintext.push(channel.name.clone()),
        }
    }
    channels
}
