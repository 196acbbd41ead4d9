//! Optional audio device discovery.
//!
//! Before the first spawn of a microphone channel, the supervisor may run a
//! device-enumeration probe: an auxiliary transcoder invocation that prints
//! its device list to stderr. The result is purely advisory (unavailable
//! devices never block spawning), but a probe that hangs past its timeout is
//! treated as a `device-discovery-timeout` recovery.
//!
//! Probe results are cached per (platform, format) for the process lifetime.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncReadExt;

use crate::error::ProbeError;

use super::command::CommandSpec;
use super::process::{LaunchedChild, ProcessLauncher};

fn probe_cache() -> &'static DashMap<(String, String), Arc<Vec<String>>> {
    static CACHE: OnceLock<DashMap<(String, String), Arc<Vec<String>>>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Returns the cached device list for a (platform, format) pair, if any.
#[must_use]
pub fn cached_devices(os: &str, format: &str) -> Option<Arc<Vec<String>>> {
    probe_cache()
        .get(&(os.to_string(), format.to_string()))
        .map(|entry| Arc::clone(entry.value()))
}

/// Composes the device-enumeration invocation for one binary and format.
#[must_use]
pub fn probe_spec(binary: &str, format: &str) -> CommandSpec {
    CommandSpec {
        binary: binary.to_string(),
        args: vec![
            "-hide_banner".to_string(),
            "-f".to_string(),
            format.to_string(),
            "-list_devices".to_string(),
            "true".to_string(),
            "-i".to_string(),
            "dummy".to_string(),
        ],
        pipe_stdin: false,
    }
}

/// Runs the device probe, bounded by `timeout`.
///
/// # Errors
///
/// - [`ProbeError::Timeout`] when the probe does not finish in time (the
///   probe process is killed).
/// - [`ProbeError::Launch`] / [`ProbeError::Io`] for spawn and read
///   failures; callers tolerate these as advisory misses.
pub async fn probe_devices(
    launcher: &dyn ProcessLauncher,
    binary: &str,
    os: &str,
    format: &str,
    timeout: Duration,
) -> Result<Arc<Vec<String>>, ProbeError> {
    if let Some(cached) = cached_devices(os, format) {
        log::debug!(
            "[Probe] cache hit for ({os}, {format}): {} device(s)",
            cached.len()
        );
        return Ok(cached);
    }

    let spec = probe_spec(binary, format);
    log::debug!("[Probe] running: {}", spec.display_line());
    let mut child = launcher.launch(&spec)?;

    let output = match tokio::time::timeout(timeout, read_probe_output(&mut child)).await {
        Ok(read) => read?,
        Err(_) => {
            child.control.force_kill();
            return Err(ProbeError::Timeout(timeout.as_millis() as u64));
        }
    };

    let devices = Arc::new(parse_device_lines(&output));
    log::info!(
        "[Probe] ({os}, {format}) reported {} device(s)",
        devices.len()
    );
    probe_cache().insert((os.to_string(), format.to_string()), Arc::clone(&devices));
    Ok(devices)
}

/// Reads the probe's combined stdout and stderr to EOF.
async fn read_probe_output(child: &mut LaunchedChild) -> std::io::Result<String> {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    let (stdout_read, stderr_read) = tokio::join!(
        child.stdout.read_to_end(&mut stdout_bytes),
        child.stderr.read_to_end(&mut stderr_bytes),
    );
    stdout_read?;
    stderr_read?;
    stdout_bytes.extend_from_slice(&stderr_bytes);
    Ok(String::from_utf8_lossy(&stdout_bytes).into_owned())
}

/// Extracts device names from transcoder device-list output.
///
/// Lines are trimmed; empty lines and header lines ending with `:` are
/// ignored. A device name is the content inside the first pair of double
/// quotes on the line, or the remainder after a leading `[<digits>]` tag.
#[must_use]
pub fn parse_device_lines(output: &str) -> Vec<String> {
    let mut devices = Vec::new();
    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() || line.ends_with(':') {
            continue;
        }
        if let Some(quoted) = first_quoted_span(line) {
            devices.push(quoted.to_string());
            continue;
        }
        if let Some(tagged) = after_digit_tag(line) {
            devices.push(tagged.to_string());
        }
    }
    devices
}

fn first_quoted_span(line: &str) -> Option<&str> {
    let open = line.find('"')?;
    let rest = &line[open + 1..];
    let close = rest.find('"')?;
    Some(&rest[..close])
}

fn after_digit_tag(line: &str) -> Option<&str> {
    let open = line.find('[')?;
    let close = line[open..].find(']')? + open;
    let tag = &line[open + 1..close];
    if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let rest = line[close + 1..].trim();
    (!rest.is_empty()).then_some(rest)
}
