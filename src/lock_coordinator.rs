//! Lock markers shared between the editor host and external clients
//!
//! A marker is a file in the project's temp directory whose presence means the editor is in a
//! transient state (compiling, reloading scripts, starting the server). Clients hold off
//! connecting while a live marker exists. Markers left behind by a killed editor are stale and
//! get cleared at startup or by the maintenance command.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::config::STALE_MARKER_GRACE_PERIOD;
use crate::fs_utils::{remove_if_exists, write_atomic};
use crate::unity_project_manager::{UnityProjectManager, is_process_alive};
use crate::{debug_log, info_log, warn_log};

/// Transient editor states signalled through marker files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMarker {
    /// Scripts are compiling
    Compiling,
    /// Script assemblies are being unloaded and reloaded
    DomainReload,
    /// The bridge server is binding its socket
    ServerStarting,
}

impl LockMarker {
    /// All markers, in the order they are checked
    pub const ALL: [LockMarker; 3] = [
        LockMarker::Compiling,
        LockMarker::DomainReload,
        LockMarker::ServerStarting,
    ];

    /// File name of the marker inside the lock directory
    pub fn file_name(&self) -> &'static str {
        match self {
            LockMarker::Compiling => "compiling.lock",
            LockMarker::DomainReload => "domainreload.lock",
            LockMarker::ServerStarting => "serverstarting.lock",
        }
    }
}

/// What is known about a marker present on disk
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerInfo {
    pub marker: LockMarker,
    pub path: PathBuf,
    /// Process that created the marker, when the file records one
    pub owner_pid: Option<u32>,
    pub age: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("IO error on lock marker '{path}': {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Timeout waiting for lock markers to clear: {0:?}")]
    Timeout(Vec<LockMarker>),
}

/// Reads and writes lock markers of one project
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    lock_dir: PathBuf,
    process_id: u32,
    grace_period: Duration,
}

impl LockCoordinator {
    /// Creates a coordinator for the project's lock directory
    pub fn for_project(project: &UnityProjectManager) -> Self {
        Self::new(project.lock_directory())
    }

    /// Creates a coordinator for an explicit lock directory
    pub fn new<P: AsRef<Path>>(lock_dir: P) -> Self {
        Self {
            lock_dir: lock_dir.as_ref().to_path_buf(),
            process_id: std::process::id(),
            grace_period: STALE_MARKER_GRACE_PERIOD,
        }
    }

    /// Overrides the age after which a marker is considered stale
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Gets the lock directory
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Path of a marker file
    pub fn marker_path(&self, marker: LockMarker) -> PathBuf {
        self.lock_dir.join(marker.file_name())
    }

    /// Creates the marker
    ///
    /// Acquiring a marker this process already owns is a no-op. A marker owned by another
    /// process is taken over, since the bridge server is the only writer.
    pub fn acquire(&self, marker: LockMarker) -> Result<(), LockError> {
        if let Some(info) = self.marker_info(marker)? {
            if info.owner_pid == Some(self.process_id) {
                return Ok(());
            }
            warn_log!(
                "Taking over {:?} marker owned by {:?}",
                marker,
                info.owner_pid
            );
        }

        let path = self.marker_path(marker);
        write_atomic(&path, self.process_id.to_string().as_bytes())
            .map_err(|source| LockError::IoError { path, source })?;
        debug_log!("Acquired {:?} marker", marker);
        Ok(())
    }

    /// Removes the marker, a missing marker is not an error
    pub fn release(&self, marker: LockMarker) -> Result<(), LockError> {
        let path = self.marker_path(marker);
        let removed = remove_if_exists(&path).map_err(|source| LockError::IoError { path, source })?;
        if removed {
            debug_log!("Released {:?} marker", marker);
        }
        Ok(())
    }

    /// Whether the marker file exists
    pub fn is_active(&self, marker: LockMarker) -> bool {
        self.marker_path(marker).exists()
    }

    /// Reads a marker from disk, `None` if absent
    pub fn marker_info(&self, marker: LockMarker) -> Result<Option<MarkerInfo>, LockError> {
        let path = self.marker_path(marker);
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LockError::IoError { path, source }),
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();

        // Content is optional, an empty or foreign marker simply has no known owner
        let owner_pid = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| content.trim().parse::<u32>().ok());

        Ok(Some(MarkerInfo {
            marker,
            path,
            owner_pid,
            age,
        }))
    }

    /// Markers currently present on disk
    pub fn active_markers(&self) -> Vec<MarkerInfo> {
        LockMarker::ALL
            .iter()
            .filter_map(|marker| self.marker_info(*marker).ok().flatten())
            .collect()
    }

    /// Markers present and not stale, the ones that should keep clients from connecting
    pub fn live_markers(&self) -> Vec<LockMarker> {
        self.live_among(&LockMarker::ALL)
    }

    fn live_among(&self, markers: &[LockMarker]) -> Vec<LockMarker> {
        markers
            .iter()
            .filter_map(|marker| self.marker_info(*marker).ok().flatten())
            .filter(|info| !self.is_stale(info))
            .map(|info| info.marker)
            .collect()
    }

    /// Whether a marker is left over from a process that can no longer remove it
    pub fn is_stale(&self, info: &MarkerInfo) -> bool {
        if info.age > self.grace_period {
            return true;
        }
        match info.owner_pid {
            Some(pid) => !is_process_alive(pid),
            None => false,
        }
    }

    /// Markers that are stale and can be removed
    pub fn list_stale(&self) -> Vec<MarkerInfo> {
        self.active_markers()
            .into_iter()
            .filter(|info| self.is_stale(info))
            .collect()
    }

    /// Removes stale markers and returns the ones removed
    pub fn clear_stale(&self) -> Result<Vec<LockMarker>, LockError> {
        let mut cleared = Vec::new();
        for info in self.list_stale() {
            remove_if_exists(&info.path).map_err(|source| LockError::IoError {
                path: info.path.clone(),
                source,
            })?;
            info_log!(
                "Cleared stale {:?} marker (owner {:?}, age {:?})",
                info.marker,
                info.owner_pid,
                info.age
            );
            cleared.push(info.marker);
        }
        Ok(cleared)
    }

    /// Waits until none of the given markers is live, polling at `poll_interval`
    ///
    /// Stale markers do not block.
    pub async fn wait_until_clear(
        &self,
        markers: &[LockMarker],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), LockError> {
        let start = Instant::now();
        loop {
            let blocking = self.live_among(markers);

            if blocking.is_empty() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(LockError::Timeout(blocking));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
