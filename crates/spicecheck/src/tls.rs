//! SPICE TLS certificate directory inspection
//!
//! Provisioning certificates is left to the environment; the prediction only
//! needs to know whether libvirt will find a complete set.

use camino::Utf8Path;
use tracing::debug;

/// CA certificate file name expected by libvirt
pub const CA_CERT: &str = "ca-cert.pem";
/// Server certificate file name expected by libvirt
pub const SERVER_CERT: &str = "server-cert.pem";
/// Server key file name expected by libvirt
pub const SERVER_KEY: &str = "server-key.pem";

/// Files that must all be present for QEMU to load its certificates
pub const REQUIRED_FILES: [&str; 3] = [CA_CERT, SERVER_CERT, SERVER_KEY];

/// Required files absent from `dir`
pub fn missing_certs(dir: &Utf8Path) -> Vec<&'static str> {
    REQUIRED_FILES
        .into_iter()
        .filter(|name| !dir.join(name).is_file())
        .collect()
}

/// Whether `dir` holds a complete certificate set
pub fn certs_available(dir: &Utf8Path) -> bool {
    let missing = missing_certs(dir);
    if !missing.is_empty() {
        debug!("Missing SPICE certificates in {dir}: {}", missing.join(", "));
    }
    missing.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_certs_available() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        assert_eq!(missing_certs(dir), REQUIRED_FILES.to_vec());
        assert!(!certs_available(dir));

        std::fs::write(dir.join(CA_CERT), "ca").unwrap();
        std::fs::write(dir.join(SERVER_CERT), "cert").unwrap();
        assert_eq!(missing_certs(dir), vec![SERVER_KEY]);

        std::fs::write(dir.join(SERVER_KEY), "key").unwrap();
        assert!(certs_available(dir));
    }

    #[test]
    fn test_missing_directory() {
        assert!(!certs_available(Utf8Path::new("/nonexistent/libvirt-spice")));
    }
}
