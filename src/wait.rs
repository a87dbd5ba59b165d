//! Extension wait utility.
//!
//! Connecting the extension is a human-gated step: someone has to click the
//! extension in a running browser. Tools that need a page call
//! [`wait_for_extension`] after bring-up; it blocks until
//! `/extension-status` reports a connected extension with at least one
//! page, or until the deadline.

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::DEFAULT_PORT;
use crate::error::{Error, Result};
use crate::lifecycle::{probe_client, EnsureOptions};
use crate::registry::ExtensionStatus;

// ============================================================================
// Options
// ============================================================================

/// Options for [`wait_for_extension`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Host the relay serves on.
    pub host: String,

    /// Port the relay serves on.
    pub port: u16,

    /// Auth token presented on polls.
    pub auth_token: Option<String>,

    /// Overall deadline.
    pub deadline: Duration,

    /// Poll interval.
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            auth_token: None,
            deadline: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

// ============================================================================
// Wait
// ============================================================================

/// Blocks until the extension is connected with at least one page.
///
/// # Errors
///
/// Returns [`Error::ExtensionNotConnected`] (carrying the port) when the
/// deadline passes first.
pub async fn wait_for_extension(opts: &WaitOptions) -> Result<ExtensionStatus> {
    let client = probe_client(&EnsureOptions {
        host: opts.host.clone(),
        port: opts.port,
        auth_token: opts.auth_token.clone(),
        ..EnsureOptions::default()
    })?;
    let url = format!("http://{}:{}/extension-status", opts.host, opts.port);
    let deadline = Instant::now() + opts.deadline;

    loop {
        if let Some(status) = poll_status(&client, &url).await {
            if status.connected && status.page_count > 0 {
                debug!(pages = status.page_count, "Extension is connected");
                return Ok(status);
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::extension_not_connected(opts.port));
        }
        tokio::time::sleep(opts.poll_interval).await;
    }
}

async fn poll_status(client: &reqwest::Client, url: &str) -> Option<ExtensionStatus> {
    let response = client.get(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json::<ExtensionStatus>().await.ok()
}

// ============================================================================
// Tests
// ============================================================================
