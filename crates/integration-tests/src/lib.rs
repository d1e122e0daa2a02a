//! Shared library code for integration tests
//!
//! This module contains constants and utilities that are shared between
//! the main test binary and helper binaries like cleanup.

// Unfortunately needed here to work with linkme
#![allow(unsafe_code)]

use linkme::distributed_slice;

/// Prefix of every libvirt domain and network created by integration tests
pub const TEST_RESOURCE_PREFIX: &str = "spicecheck-it-";

/// A test function that returns a Result
pub type TestFn = fn() -> color_eyre::Result<()>;

/// Metadata for a registered integration test
#[derive(Debug)]
pub struct IntegrationTest {
    /// Name of the integration test
    pub name: &'static str,
    /// Test function to execute
    pub f: TestFn,
}

impl IntegrationTest {
    /// Create a new integration test with the given name and function
    pub const fn new(name: &'static str, f: TestFn) -> Self {
        Self { name, f }
    }
}

/// Distributed slice holding all registered integration tests
#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register an integration test with less boilerplate.
///
/// # Examples
///
/// ```ignore
/// fn test_listen_all() -> Result<()> {
///     run_scenario("listen-all", &spice, None)
/// }
/// integration_test!(test_listen_all);
/// ```
#[macro_export]
macro_rules! integration_test {
    ($fn_name:ident) => {
        ::paste::paste! {
            #[distributed_slice($crate::INTEGRATION_TESTS)]
            static [<$fn_name:upper>]: $crate::IntegrationTest =
                $crate::IntegrationTest::new(stringify!($fn_name), $fn_name);
        }
    };
}

/// A libvirt object name for a test resource.
///
/// `label` is sanitized so the name stays valid for both domains and
/// networks.
pub fn resource_name(label: &str, id: &str) -> String {
    let label = label.replace(|c: char| !c.is_ascii_alphanumeric(), "-");
    format!("{TEST_RESOURCE_PREFIX}{label}-{id}")
}

/// Whether `name` was created by [`resource_name`]
pub fn is_test_resource(name: &str) -> bool {
    name.starts_with(TEST_RESOURCE_PREFIX)
}
