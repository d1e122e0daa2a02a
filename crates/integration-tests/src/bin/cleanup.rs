//! Cleanup utility for integration test resources
//!
//! This binary destroys libvirt domains and networks left behind by
//! integration tests, identified by their name prefix.

use std::process::Command;

use integration_tests::is_test_resource;

/// Names printed by `virsh <list_cmd> --name`, filtered to test resources
fn list_test_resources(list_cmd: &[&str]) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let output = Command::new("virsh").args(list_cmd).output()?;
    if !output.status.success() {
        return Err(format!(
            "virsh {} failed: {}",
            list_cmd.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|name| is_test_resource(name))
        .map(ToOwned::to_owned)
        .collect())
}

fn destroy_all(kind: &str, list_cmd: &[&str], destroy_cmd: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Cleaning up integration test {kind}s...");
    let names = list_test_resources(list_cmd)?;
    if names.is_empty() {
        println!("No integration test {kind}s found to clean up");
        return Ok(());
    }

    let mut cleaned = 0;
    for name in &names {
        print!("  Destroying {kind} {name}... ");
        let output = Command::new("virsh").args([destroy_cmd, name]).output()?;
        if output.status.success() {
            println!("✓");
            cleaned += 1;
        } else {
            println!("✗ (failed)");
            eprintln!("    Error: {}", String::from_utf8_lossy(&output.stderr));
        }
    }

    println!("Cleanup completed: {cleaned} {kind}(s) removed");
    Ok(())
}

fn main() {
    let mut errors = Vec::new();

    if let Err(e) = destroy_all("domain", &["list", "--name"], "destroy") {
        eprintln!("Error during domain cleanup: {e}");
        errors.push(format!("domains: {e}"));
    }

    if let Err(e) = destroy_all("network", &["net-list", "--name"], "net-destroy") {
        eprintln!("Error during network cleanup: {e}");
        errors.push(format!("networks: {e}"));
    }

    if !errors.is_empty() {
        eprintln!("Cleanup completed with errors: {}", errors.join(", "));
        std::process::exit(1);
    }
}
