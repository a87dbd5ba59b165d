//! Singleton lifecycle supervisor.
//!
//! Short-lived client invocations need a relay that outlives them, so the
//! human-in-the-loop step of activating the extension happens once. The
//! supervisor guarantees that the target port serves `/version` with the
//! expected version:
//!
//! 1. Probe `/version` with a short deadline.
//! 2. Same version → done, `started: false`.
//! 3. Newer version → leave it alone (forward compatibility).
//! 4. Older version → terminate the process holding the port and wait for
//!    the port to free.
//! 5. Spawn a detached child running the relay entry point: stdio closed,
//!    process group severed from the caller.
//! 6. Poll `/version` every ~500 ms until it matches or the start timeout
//!    elapses.
//!
//! The contract is defined by observable behavior (the port serves the
//! expected version), not spawn mechanics; the relay binding its port
//! before all other work is what makes the probe authoritative.

// ============================================================================
// Imports
// ============================================================================

use std::cmp::Ordering;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_PORT, RELAY_VERSION};
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Deadline for a single `/version` probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default readiness poll interval.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default overall start timeout.
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a stale relay gets to exit after SIGTERM before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

// ============================================================================
// Options
// ============================================================================

/// Options for [`ensure_relay_running`].
#[derive(Debug, Clone)]
pub struct EnsureOptions {
    /// Host the relay serves on.
    pub host: String,

    /// Port the relay serves on.
    pub port: u16,

    /// Auth token presented on probes and handed to the spawned relay.
    pub auth_token: Option<String>,

    /// Relay binary to spawn; defaults to the current executable.
    pub relay_binary: Option<PathBuf>,

    /// Overall deadline for the spawned relay to become ready.
    pub start_timeout: Duration,

    /// Readiness poll interval.
    pub poll_interval: Duration,
}

impl Default for EnsureOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            auth_token: None,
            relay_binary: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Outcome of [`ensure_relay_running`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureOutcome {
    /// Whether this call spawned a new relay process.
    pub started: bool,

    /// The version now serving the port.
    pub version: String,
}

/// `/version` response body.
#[derive(Debug, Clone, Deserialize)]
struct VersionInfo {
    version: String,
    #[serde(default)]
    pid: Option<u32>,
}

// ============================================================================
// Supervisor
// ============================================================================

/// Guarantees a relay of the expected version is serving the port.
///
/// # Errors
///
/// - [`Error::StartTimeout`] when the spawned relay never becomes ready
/// - [`Error::SpawnFailed`] when the child cannot be spawned
/// - [`Error::Config`] when a stale relay cannot be replaced
pub async fn ensure_relay_running(opts: &EnsureOptions) -> Result<EnsureOutcome> {
    let client = probe_client(opts)?;

    if let Some(info) = probe_version(&client, opts).await {
        match compare_versions(&info.version, RELAY_VERSION) {
            Ordering::Equal => {
                debug!(version = %info.version, port = opts.port, "Relay already running");
                return Ok(EnsureOutcome {
                    started: false,
                    version: info.version,
                });
            }
            Ordering::Greater => {
                // A newer relay serves our needs; never downgrade it.
                info!(version = %info.version, port = opts.port, "Newer relay already running");
                return Ok(EnsureOutcome {
                    started: false,
                    version: info.version,
                });
            }
            Ordering::Less => {
                info!(
                    stale = %info.version,
                    expected = RELAY_VERSION,
                    port = opts.port,
                    "Terminating stale relay"
                );
                terminate_stale(&client, opts, &info).await?;
            }
        }
    }

    spawn_detached(opts)?;
    await_ready(&client, opts).await
}

/// Probes `/version`, returning `None` when nothing answers in time.
async fn probe_version(client: &reqwest::Client, opts: &EnsureOptions) -> Option<VersionInfo> {
    let url = format!("http://{}:{}/version", opts.host, opts.port);
    let response = client.get(&url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json::<VersionInfo>().await.ok()
}

/// Terminates a stale relay and waits for the port to free.
async fn terminate_stale(
    client: &reqwest::Client,
    opts: &EnsureOptions,
    info: &VersionInfo,
) -> Result<()> {
    let Some(pid) = info.pid else {
        return Err(Error::config(format!(
            "stale relay {} on port {} did not report a pid; cannot replace it",
            info.version, opts.port
        )));
    };

    signal_process(pid, false)?;

    let deadline = Instant::now() + TERMINATE_GRACE;
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if probe_version(client, opts).await.is_none() {
            debug!(pid, "Stale relay exited; port is free");
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
    }

    warn!(pid, "Stale relay ignored SIGTERM; escalating");
    signal_process(pid, true)?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

#[cfg(unix)]
fn signal_process(pid: u32, force: bool) -> Result<()> {
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    // ESRCH means the process is already gone, which is the goal.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(Error::Io(err));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_process(_pid: u32, _force: bool) -> Result<()> {
    Err(Error::config(
        "replacing a stale relay is only supported on unix",
    ))
}

/// Spawns the relay entry point detached from the caller: stdio closed and
/// the process group severed, so the relay survives the invoking tool.
fn spawn_detached(opts: &EnsureOptions) -> Result<()> {
    let binary = match &opts.relay_binary {
        Some(path) => path.clone(),
        None => std::env::current_exe().map_err(Error::spawn_failed)?,
    };

    let mut cmd = Command::new(&binary);
    cmd.env("CDP_RELAY_PORT", opts.port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(token) = &opts.auth_token {
        cmd.env("CDP_RELAY_AUTH_TOKEN", token);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().map_err(Error::spawn_failed)?;
    info!(
        binary = %binary.display(),
        pid = child.id(),
        port = opts.port,
        "Spawned detached relay"
    );
    Ok(())
}

/// Polls `/version` until it serves the expected version.
async fn await_ready(client: &reqwest::Client, opts: &EnsureOptions) -> Result<EnsureOutcome> {
    let deadline = Instant::now() + opts.start_timeout;
    loop {
        if let Some(info) = probe_version(client, opts).await {
            if compare_versions(&info.version, RELAY_VERSION) == Ordering::Equal {
                info!(port = opts.port, "Relay is ready");
                return Ok(EnsureOutcome {
                    started: true,
                    version: info.version,
                });
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::start_timeout(opts.start_timeout.as_millis() as u64));
        }
        tokio::time::sleep(opts.poll_interval).await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Builds the short-deadline probe client.
pub(crate) fn probe_client(opts: &EnsureOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(PROBE_TIMEOUT);
    if let Some(token) = &opts.auth_token {
        let mut headers = reqwest::header::HeaderMap::new();
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| Error::config("auth token is not a valid header value"))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
        builder = builder.default_headers(headers);
    }
    Ok(builder.build()?)
}

/// Compares dotted numeric versions; missing segments count as zero.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let (x, y) = (
            a.get(i).copied().unwrap_or(0),
            b.get(i).copied().unwrap_or(0),
        );
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

// ============================================================================
// Tests
// ============================================================================
