use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Name of the log file inside the log directory
const LOG_FILE_NAME: &str = "unity_mcp_bridge.log";

/// Initialize logging based on whether we're running tests or the main application
///
/// The application logs to a file because stdout carries the MCP protocol. Calling this more
/// than once is harmless.
pub fn init_logging() {
    if cfg!(test) {
        init_test_logging();
    } else {
        init_file_logging();
    }
}

/// Initialize logging to stderr, for CLI commands that print results on stdout
pub fn init_stderr_logging(level: LevelFilter) {
    let mut builder = Builder::from_default_env();
    builder
        .target(Target::Stderr)
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));
    let _ = builder.try_init();
}

/// Initialize logging for tests (output to stdout)
fn init_test_logging() {
    let mut builder = Builder::from_default_env();
    builder
        .target(Target::Stdout)
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}:{}] {}",
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        });
    let _ = builder.try_init();
}

/// Initialize logging for the application (output to file)
fn init_file_logging() {
    let log_dir = get_log_directory();
    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log directory: {}", e);
        return;
    }

    let log_file = log_dir.join(LOG_FILE_NAME);
    let target: Box<dyn Write + Send> = match fs::OpenOptions::new().create(true).append(true).open(&log_file) {
        Ok(file) => Box::new(file),
        Err(e) => {
            eprintln!("Failed to open log file {}: {}", log_file.display(), e);
            return;
        }
    };

    let mut builder = Builder::from_default_env();
    builder
        .target(Target::Pipe(target))
        .filter_level(LevelFilter::Info)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] [{}:{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        });

    if builder.try_init().is_ok() {
        log::info!("Logging initialized to file: {}", log_file.display());
    }
}

/// Get the appropriate log directory based on the operating system
fn get_log_directory() -> PathBuf {
    if let Some(data_dir) = dirs::data_local_dir() {
        data_dir.join("UnityMcpBridge")
    } else {
        // Fallback to current directory if we can't determine the local data directory
        PathBuf::from("./logs")
    }
}

/// Macro for debug logging that replaces println! for debug messages
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

/// Macro for info logging
#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

/// Macro for warning logging
#[macro_export]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        log::warn!($($arg)*)
    };
}

/// Macro for error logging
#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory() {
        let log_dir = get_log_directory();
        assert!(log_dir.to_string_lossy().contains("UnityMcpBridge") || log_dir.ends_with("logs"));
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logging();
        init_logging();
        init_stderr_logging(LevelFilter::Warn);

        debug_log!("This is a debug message");
        info_log!("This is an info message");
        warn_log!("This is a warning message");
        error_log!("This is an error message");
    }
}
