use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

const VERSION_ENV: &str = "TABPROXY_VERSION";

fn main() {
    println!("cargo:rerun-if-env-changed={VERSION_ENV}");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/tags");

    let version = env::var(VERSION_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(describe_tag)
        .unwrap_or_else(|| format!("0.0.0-unknown-{}", build_epoch()));

    println!("cargo:rustc-env={VERSION_ENV}={version}");
}

/// Version from the nearest `v*` tag; local modifications get a build stamp.
fn describe_tag() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--match", "v*", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())?;

    let described = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let described = described.trim_start_matches('v');
    if described.is_empty() {
        return None;
    }

    Some(match described.strip_suffix("-dirty") {
        Some(base) => format!("{}-dirty.{}", base, build_epoch()),
        None => described.to_string(),
    })
}

fn build_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
