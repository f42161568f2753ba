use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use flexi_logger::writers::{FileLogWriter, LogWriter};
use flexi_logger::{Cleanup, Criterion, DeferredNow, FileSpec, Naming};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{AuthProfile, ChildPorts, ChildProcess};

const LOG_ROTATE_BYTES: u64 = 5 * 1024 * 1024;
const LOG_BACKUPS: usize = 5;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Auth profile not found: {}", .0.display())]
    MissingProfile(PathBuf),
    #[error("Unable to locate child command at {}", .0.display())]
    MissingCommand(PathBuf),
    #[error("Cannot bootstrap more active profiles than available slots ({profiles} > {slots}).")]
    TooManyProfiles { profiles: usize, slots: usize },
    #[error("Failed to open log writer for profile '{profile}': {source}")]
    LogWriter {
        profile: String,
        #[source]
        source: flexi_logger::FlexiLoggerError,
    },
    #[error("Failed to spawn child for profile '{profile}': {source}")]
    Spawn {
        profile: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything the launcher needs beyond the profile and ports. Owned by the
/// slot manager so recycled children launch with the same settings.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Command used to start one child server.
    pub command: PathBuf,
    /// Extra environment overlaid on the inherited one.
    pub env: HashMap<String, String>,
    pub headless: bool,
    pub log_dir: PathBuf,
}

/// Launch one child proxy process for the given profile.
///
/// Stdout and stderr are pumped by detached threads into a per-child rotating
/// log file (5 MiB, 5 backups kept). The child inherits the coordinator's
/// working directory and environment, overlaid with `config.env`.
pub fn launch_child(
    profile: &AuthProfile,
    ports: ChildPorts,
    config: &LaunchConfig,
) -> Result<Arc<ChildProcess>, LaunchError> {
    if !profile.path.exists() {
        return Err(LaunchError::MissingProfile(profile.path.clone()));
    }
    if !config.command.exists() {
        return Err(LaunchError::MissingCommand(config.command.clone()));
    }

    std::fs::create_dir_all(&config.log_dir)?;
    let (writer, log_path) = child_log_writer(profile, config)?;

    let mut command = Command::new(&config.command);
    command
        .arg("--server-port")
        .arg(ports.api_port.to_string())
        .arg("--stream-port")
        .arg(ports.stream_port.to_string())
        .arg("--debug-port")
        .arg(ports.debug_port.to_string())
        .arg("--active-auth-json")
        .arg(&profile.path)
        .envs(&config.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if config.headless {
        command.arg("--headless");
    }

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        profile: profile.name.clone(),
        source,
    })?;

    let writer = Arc::new(writer);
    if let Some(stdout) = child.stdout.take() {
        spawn_pump(stdout, writer.clone(), "[stdout] ", &profile.name);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_pump(stderr, writer.clone(), "[stderr] ", &profile.name);
    }

    info!(
        profile = %profile.name,
        pid = child.id(),
        api_port = ports.api_port,
        stream_port = ports.stream_port,
        debug_port = ports.debug_port,
        "Launched child process"
    );

    Ok(Arc::new(ChildProcess::new(
        profile.clone(),
        ports,
        Box::new(child),
        Some(log_path),
    )))
}

fn child_log_writer(
    profile: &AuthProfile,
    config: &LaunchConfig,
) -> Result<(FileLogWriter, PathBuf), LaunchError> {
    let spec = FileSpec::default()
        .directory(&config.log_dir)
        .basename(&profile.name)
        .suffix("log")
        .suppress_timestamp();
    let writer = FileLogWriter::builder(spec)
        .append()
        .rotate(
            Criterion::Size(LOG_ROTATE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(LOG_BACKUPS),
        )
        .format(child_log_format)
        .try_build()
        .map_err(|source| LaunchError::LogWriter {
            profile: profile.name.clone(),
            source,
        })?;
    // With rotation enabled flexi_logger writes to `<name>_rCURRENT.log`.
    let log_path = config.log_dir.join(format!("{}_rCURRENT.log", profile.name));
    Ok((writer, log_path))
}

fn child_log_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    write!(
        w,
        "{} - {} - {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.args()
    )
}

fn spawn_pump(
    stream: impl Read + Send + 'static,
    writer: Arc<FileLogWriter>,
    prefix: &'static str,
    profile_name: &str,
) {
    let name = profile_name.to_string();
    let spawned = std::thread::Builder::new()
        .name(format!("pump-{name}"))
        .spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let _ = writer.write(
                    &mut DeferredNow::new(),
                    &log::Record::builder()
                        .level(log::Level::Info)
                        .target("child")
                        .args(format_args!("{prefix}{line}"))
                        .build(),
                );
            }
            let _ = writer.flush();
        });
    if let Err(err) = spawned {
        warn!(profile = %name, error = %err, "Failed to spawn stream pump thread");
    }
}
