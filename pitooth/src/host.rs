/*!
 * Host Environment Probe
 * Gate construction on Linux with a device-tree board model
 */

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";

/// Checks that we are on a Raspberry Pi class Linux board. Returns the board model.
///
/// Runs before any bus traffic so a misconfigured host fails cleanly instead
/// of hanging on D-Bus calls.
pub fn check_host() -> Result<String> {
    check_os(std::env::consts::OS)?;
    check_host_at(DEVICE_TREE_MODEL)
}

fn check_os(os: &str) -> Result<()> {
    if os != "linux" {
        return Err(Error::UnsupportedHost(format!("unsupported OS: {}", os)));
    }
    Ok(())
}

pub fn check_host_at(model_path: impl AsRef<Path>) -> Result<String> {
    let model_path = model_path.as_ref();
    let raw = fs::read(model_path).map_err(|e| {
        Error::UnsupportedHost(format!(
            "not a Raspberry Pi class board ({}: {})",
            model_path.display(),
            e
        ))
    })?;

    // device-tree strings are NUL terminated
    let model = String::from_utf8_lossy(&raw)
        .trim_end_matches('\0')
        .trim()
        .to_string();
    tracing::debug!("Host board model: {}", model);
    Ok(model)
}
