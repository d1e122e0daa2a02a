//! Policy-level failures of prediction and verification

use std::collections::{BTreeMap, BTreeSet};

/// The port search ran past the end of the display port range
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// No free port between the range start and `max`
    #[error("Unable to find an unused port: reached {port}, range ends at {max}")]
    Overflow {
        /// First port past the range that would have been tried
        port: u32,
        /// Configured end of the range (inclusive)
        max: u16,
    },
}

/// Which channel list a mismatch is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChannelKind {
    /// `tls-channel=` entries
    Tls,
    /// `plaintext-channel=` entries
    Plaintext,
}

/// An option present on both sides with different values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionChange {
    /// Option key
    pub key: String,
    /// Value we predicted
    pub predicted: String,
    /// Value QEMU was started with
    pub observed: String,
}

/// The live system does not behave as predicted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredictionMismatch {
    /// The `-spice` option set differs
    #[error(
        "SPICE options differ from prediction: created {created:?}, deleted {deleted:?}, changed {changed:?}"
    )]
    Options {
        /// Observed but not predicted
        created: BTreeMap<String, String>,
        /// Predicted but not observed
        deleted: BTreeMap<String, String>,
        /// Present on both sides with different values
        changed: Vec<OptionChange>,
    },
    /// A channel set differs
    #[error("{kind} channels differ: predicted {predicted:?}, observed {observed:?}")]
    Channels {
        /// Which list
        kind: ChannelKind,
        /// Predicted channel names
        predicted: BTreeSet<String>,
        /// Observed channel names
        observed: BTreeSet<String>,
    },
    /// Startup succeeded although a failure was predicted
    #[error("Predicted startup failure matching {patterns:?}, but the domain started")]
    UnexpectedSuccess {
        /// Predicted failure patterns
        patterns: Vec<String>,
    },
    /// Startup failed although success was predicted
    #[error("Predicted a successful start, but startup failed: {output}")]
    UnexpectedFailure {
        /// Error output of the failed start
        output: String,
    },
    /// Startup failed as predicted, but with a different error
    #[error("Startup failed as predicted, but no pattern of {patterns:?} matches: {output}")]
    FailureSignature {
        /// Predicted failure patterns
        patterns: Vec<String>,
        /// Error output of the failed start
        output: String,
    },
    /// A host address listens where it should not, or the other way round
    #[error("{addr} port {port}: predicted listening={predicted}, observed listening={observed}")]
    Listening {
        /// Probed address
        addr: String,
        /// Probed port
        port: u16,
        /// Whether we expected a listener
        predicted: bool,
        /// Whether a listener answered
        observed: bool,
    },
}
