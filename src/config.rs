//! Engine configuration.
//!
//! [`Config`] carries everything a resource instance needs to find its
//! on-disk environments and to tune the command pipeline. Time-based
//! policies are deliberately few: the commit coalescing window and the
//! startup grace period are the only ones, and both are disabled in test
//! mode.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SinkError};

/// Environment variable that switches the engine into test mode.
///
/// Test mode redirects the storage root to a per-process scratch location
/// and disables the wall-clock timers (idle commit window, startup grace).
pub const TESTMODE_ENV: &str = "SINK_TESTMODE";

/// Configuration for one resource instance.
///
/// # Example
///
/// ```rust
/// use sinkstore::Config;
///
/// let config = Config::new("/var/lib/sink", "imap.account1");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Root directory under which all resource environments live.
    pub storage_root: PathBuf,

    /// Instance id of this resource; names the environment files.
    pub instance_id: String,

    /// Maximum number of commands applied per pipeline transaction.
    pub batch_size: usize,

    /// Idle window after which a pending client-command transaction is
    /// committed, so bursts coalesce into one commit.
    pub commit_interval: Duration,

    /// Grace period after startup before an unused resource exits.
    pub startup_grace: Duration,

    /// Grace period after the last client disconnects before exit.
    pub disconnect_grace: Duration,

    /// Whether wall-clock timers are disabled (set from [`TESTMODE_ENV`]).
    pub test_mode: bool,
}

impl Config {
    /// Creates a configuration with default tuning for the given storage
    /// root and instance id. Honors [`TESTMODE_ENV`].
    pub fn new(storage_root: impl Into<PathBuf>, instance_id: impl Into<String>) -> Self {
        let test_mode = env::var_os(TESTMODE_ENV).is_some_and(|v| !v.is_empty() && v != "0");
        Self {
            storage_root: storage_root.into(),
            instance_id: instance_id.into(),
            batch_size: 100,
            commit_interval: Duration::from_millis(10),
            startup_grace: Duration::from_secs(60),
            disconnect_grace: Duration::from_secs(1),
            test_mode,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the instance id is empty or contains
    /// a path separator, or if the batch size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(SinkError::config("instance_id must not be empty"));
        }
        if self.instance_id.contains('/') || self.instance_id.contains('\\') {
            return Err(SinkError::config(
                "instance_id must not contain path separators",
            ));
        }
        if self.batch_size == 0 {
            return Err(SinkError::config("batch_size must be at least 1"));
        }
        Ok(())
    }

    /// Path of the entity environment.
    pub fn main_path(&self) -> PathBuf {
        self.storage_root.join(&self.instance_id)
    }

    /// Path of the client command queue environment.
    pub fn user_queue_path(&self) -> PathBuf {
        self.storage_root
            .join(format!("{}.userqueue", self.instance_id))
    }

    /// Path of the synchronizer command queue environment.
    pub fn synchronizer_queue_path(&self) -> PathBuf {
        self.storage_root
            .join(format!("{}.synchronizerqueue", self.instance_id))
    }

    /// Path of the change-replay progress environment.
    pub fn change_replay_path(&self) -> PathBuf {
        self.storage_root
            .join(format!("{}.changereplay", self.instance_id))
    }

    /// Path of the synchronizer scratch environment.
    pub fn synchronization_path(&self) -> PathBuf {
        self.storage_root
            .join(format!("{}.synchronization", self.instance_id))
    }

    /// Path of the advisory lock file guarding the instance.
    pub fn lock_path(&self) -> PathBuf {
        self.storage_root
            .join(format!("{}.lock", self.instance_id))
    }

    /// All five environment paths, in layout order.
    pub fn environment_paths(&self) -> [PathBuf; 5] {
        [
            self.main_path(),
            self.user_queue_path(),
            self.synchronizer_queue_path(),
            self.change_replay_path(),
            self.synchronization_path(),
        ]
    }

    /// The effective commit window: zero in test mode.
    pub fn effective_commit_interval(&self) -> Duration {
        if self.test_mode {
            Duration::ZERO
        } else {
            self.commit_interval
        }
    }
}
