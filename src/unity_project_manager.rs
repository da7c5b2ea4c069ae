use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::debug_log;
use crate::fs_utils::{remove_if_exists, write_atomic};

/// Directory (relative to the project) holding the persisted port record
const PORT_RECORD_DIR: &str = "UserSettings/UnityMcpBridge";

/// File name of the persisted port record
const PORT_RECORD_FILE: &str = "server.json";

/// Directory (relative to the project) holding lock markers, inside Unity's per-project Temp folder
const LOCK_DIR: &str = "Temp/UnityMcpBridge";

/// Locates a Unity project on disk and the bridge files stored inside it
#[derive(Debug, Clone)]
pub struct UnityProjectManager {
    project_path: PathBuf,
}

/// Where the bridge server of a project is listening
///
/// Written by the bridge server on every start, read by clients to find the port.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRecord {
    pub port: u16,
    pub process_id: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

impl PortRecord {
    /// Creates a record for the current process listening on `port`
    pub fn for_current_process(port: u16, project_path: &Path) -> Self {
        Self {
            port,
            process_id: std::process::id(),
            timestamp: Utc::now(),
            project_path: Some(project_path.to_string_lossy().into_owned()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UnityProjectError {
    #[error("Not a Unity project: {0}")]
    NotUnityProject(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("No running Unity instance: {0}")]
    NoRunningInstance(String),
}

impl UnityProjectManager {
    /// Creates a new UnityProjectManager with the given project path
    ///
    /// The path is used as given; use `from_argument` to apply `cd` resolution first.
    pub fn new<P: AsRef<Path>>(project_path: P) -> Self {
        Self {
            project_path: project_path.as_ref().to_path_buf(),
        }
    }

    /// Creates a manager from a user-supplied path, resolved against the current directory
    pub fn from_argument<P: AsRef<Path>>(argument: P) -> Result<Self, UnityProjectError> {
        let cwd = std::env::current_dir()?;
        Ok(Self::new(resolve_project_path(argument, &cwd)))
    }

    /// Checks if the given path is a valid Unity project
    pub fn is_unity_project_path<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        path.join("ProjectSettings").join("ProjectVersion.txt").exists()
            && path.join("Assets").exists()
            && path.join("Packages").exists()
    }

    /// Checks if the managed path is a valid Unity project
    pub fn is_unity_project(&self) -> bool {
        Self::is_unity_project_path(&self.project_path)
    }

    /// Gets the project path
    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Path of the persisted port record
    pub fn port_record_path(&self) -> PathBuf {
        self.project_path.join(PORT_RECORD_DIR).join(PORT_RECORD_FILE)
    }

    /// Directory holding the lock markers of this project
    pub fn lock_directory(&self) -> PathBuf {
        self.project_path.join(LOCK_DIR)
    }

    /// Reads the persisted port record
    pub fn read_port_record(&self) -> Result<PortRecord, UnityProjectError> {
        let path = self.port_record_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UnityProjectError::NoRunningInstance(format!(
                    "no port record at '{}'",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Persists the port record, replacing any previous one atomically
    pub fn write_port_record(&self, record: &PortRecord) -> Result<(), UnityProjectError> {
        let content = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.port_record_path(), &content)?;
        debug_log!(
            "Wrote port record {} (pid {}) to {}",
            record.port,
            record.process_id,
            self.port_record_path().display()
        );
        Ok(())
    }

    /// Removes the port record, returns whether one existed
    pub fn remove_port_record(&self) -> Result<bool, UnityProjectError> {
        Ok(remove_if_exists(&self.port_record_path())?)
    }

    /// Resolves the port the project's bridge server is listening on
    ///
    /// Only the persisted record is trusted, ports are never scanned. A record whose process is
    /// no longer running is treated as no record at all.
    pub fn resolve_port(&self) -> Result<u16, UnityProjectError> {
        let record = self.read_port_record()?;
        if !is_process_alive(record.process_id) {
            return Err(UnityProjectError::NoRunningInstance(format!(
                "process {} recorded for port {} is not running",
                record.process_id, record.port
            )));
        }
        Ok(record.port)
    }
}

/// Resolves a project path argument the way a shell resolves `cd`
///
/// Absolute paths are used as-is, relative ones are joined to `cwd`. A leading `~` is expanded
/// to the home directory, and `.`/`..` are collapsed lexically like `cd -L`.
pub fn resolve_project_path<P: AsRef<Path>>(path: P, cwd: &Path) -> PathBuf {
    let expanded = expand_home(path.as_ref());
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    normalize_lexically(&joined)
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                if matches!(normalized.components().next_back(), Some(Component::Normal(_))) {
                    normalized.pop();
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Checks if a process with the given PID is running
pub fn is_process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_project;

    #[test]
    #[cfg(unix)]
    fn test_relative_path_resolves_against_cwd() {
        let resolved = resolve_project_path("./proj", Path::new("/home/u"));
        assert_eq!(resolved, PathBuf::from("/home/u/proj"));

        let resolved = resolve_project_path("../other/./proj", Path::new("/home/u"));
        assert_eq!(resolved, PathBuf::from("/home/other/proj"));
    }

    #[test]
    #[cfg(unix)]
    fn test_absolute_path_is_used_as_is() {
        let resolved = resolve_project_path("/work/game", Path::new("/home/u"));
        assert_eq!(resolved, PathBuf::from("/work/game"));

        let resolved = resolve_project_path("/../work", Path::new("/home/u"));
        assert_eq!(resolved, PathBuf::from("/work"));
    }

    #[test]
    fn test_home_expansion() {
        if let Some(home) = dirs::home_dir() {
            let resolved = resolve_project_path("~/games/proj", Path::new("/somewhere"));
            assert_eq!(resolved, normalize_lexically(&home.join("games").join("proj")));
        }
    }

    #[test]
    fn test_is_unity_project() {
        let project = create_test_project();
        assert!(UnityProjectManager::new(project.path()).is_unity_project());

        let empty = tempfile::TempDir::new().unwrap();
        assert!(!UnityProjectManager::new(empty.path()).is_unity_project());
    }

    #[test]
    fn test_missing_record_is_no_running_instance() {
        let project = create_test_project();
        let manager = UnityProjectManager::new(project.path());
        assert!(matches!(
            manager.resolve_port(),
            Err(UnityProjectError::NoRunningInstance(_))
        ));
    }

    #[test]
    fn test_port_record_round_trip() {
        let project = create_test_project();
        let manager = UnityProjectManager::new(project.path());

        let record = PortRecord::for_current_process(58231, project.path());
        manager.write_port_record(&record).unwrap();

        assert_eq!(manager.read_port_record().unwrap(), record);
        assert_eq!(manager.resolve_port().unwrap(), 58231);

        let raw = std::fs::read_to_string(manager.port_record_path()).unwrap();
        assert!(raw.contains("\"processId\""));

        assert!(manager.remove_port_record().unwrap());
        assert!(manager.resolve_port().is_err());
    }

    #[test]
    fn test_record_from_dead_process_is_ignored() {
        let project = create_test_project();
        let manager = UnityProjectManager::new(project.path());

        let record = PortRecord {
            port: 58000,
            process_id: u32::MAX - 1,
            timestamp: Utc::now(),
            project_path: None,
        };
        manager.write_port_record(&record).unwrap();

        assert!(matches!(
            manager.resolve_port(),
            Err(UnityProjectError::NoRunningInstance(_))
        ));
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }
}
