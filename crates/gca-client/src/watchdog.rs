//! §4.7 step 5 / §5: `last-sync.txt` and the `request-restart` marker.
//! A successful sync touches the former and deletes the latter; a
//! background watchdog creates the marker if no sync has succeeded
//! within its timeout, prompting an external supervisor (out of scope
//! per §1) to restart the process.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gca_core::error::Result;
use tracing::{info, warn};

pub struct Watchdog {
    last_sync_path: PathBuf,
    restart_request_path: PathBuf,
}

impl Watchdog {
    pub fn new(data_dir: &Path) -> Self {
        Watchdog {
            last_sync_path: data_dir.join("last-sync.txt"),
            restart_request_path: data_dir.join("request-restart"),
        }
    }

    /// Called after a sync cycle that reconciled successfully (reached
    /// and verified at least one server, even if it had nothing to
    /// resend). Records the current time and clears any pending
    /// restart request.
    pub fn record_success(&self) -> Result<()> {
        let now_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        std::fs::write(&self.last_sync_path, now_unix.to_string())?;
        if self.restart_request_path.exists() {
            std::fs::remove_file(&self.restart_request_path)?;
        }
        Ok(())
    }

    fn last_sync_unix(&self) -> Option<u64> {
        let raw = std::fs::read_to_string(&self.last_sync_path).ok()?;
        raw.trim().parse().ok()
    }

    /// §4.7: if no sync has succeeded within `timeout`, create the
    /// restart-request marker. A no-op if the marker already exists or a
    /// sync has landed recently enough.
    pub fn check(&self, timeout: Duration) -> Result<()> {
        let now_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let overdue = match self.last_sync_unix() {
            Some(last) => now_unix.saturating_sub(last) >= timeout.as_secs(),
            None => true,
        };
        if !overdue {
            return Ok(());
        }
        if self.restart_request_path.exists() {
            return Ok(());
        }
        warn!(timeout_secs = timeout.as_secs(), "no successful sync within watchdog timeout, requesting restart");
        std::fs::write(&self.restart_request_path, b"")?;
        Ok(())
    }

    /// Fatal client-side `IOFailure` (§7: a failure touching the client's
    /// own history file is fatal and triggers a restart) goes straight to
    /// the marker without waiting out the timeout.
    pub fn request_restart_now(&self, reason: &str) -> Result<()> {
        if !self.restart_request_path.exists() {
            info!(reason, "requesting immediate restart");
            std::fs::write(&self.restart_request_path, reason.as_bytes())?;
        }
        Ok(())
    }
}
