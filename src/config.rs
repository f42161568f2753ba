use std::path::PathBuf;

use clap::{Parser, ValueEnum};

pub const DEFAULT_COORDINATOR_HOST: &str = "0.0.0.0";
pub const DEFAULT_COORDINATOR_PORT: u16 = 2048;
pub const DEFAULT_BASE_API_PORT: u16 = 3100;
pub const DEFAULT_BASE_STREAM_PORT: u16 = 3200;
pub const DEFAULT_BASE_DEBUG_PORT: u16 = 9222;
pub const DEFAULT_PORT_STEP: u16 = 1;

/// Environment variable the coordinator exports so downstream components can
/// find the hydrated API-key file.
pub const AUTH_KEY_FILE_ENV: &str = "AUTH_KEY_FILE_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProfileBackend {
    Local,
    ObjectStore,
}

#[derive(Debug, Parser)]
#[command(name = "proxy-coordinator", about = "Launch the proxy coordinator.")]
pub struct Cli {
    /// Directory containing auth profile JSON files (local backend).
    #[arg(long, default_value = "auth_profiles/active")]
    pub profiles: PathBuf,

    /// Profile backend to hydrate auth material from.
    #[arg(long, value_enum, env = "PROFILE_BACKEND", default_value = "local")]
    pub profile_backend: ProfileBackend,

    /// Bucket holding auth profiles (object-store backend).
    #[arg(long, env = "AUTH_PROFILE_S3_BUCKET")]
    pub auth_profile_bucket: Option<String>,

    /// Key prefix inside the bucket.
    #[arg(long, env = "AUTH_PROFILE_S3_PREFIX")]
    pub auth_profile_prefix: Option<String>,

    /// Bucket region override.
    #[arg(long, env = "AUTH_PROFILE_S3_REGION")]
    pub auth_profile_region: Option<String>,

    /// Where hydrated profiles are cached.
    #[arg(long, env = "AUTH_PROFILE_CACHE_DIR", default_value = "/tmp/auth_profiles")]
    pub auth_profile_cache_dir: PathBuf,

    /// Starting API port for child processes.
    #[arg(long, default_value_t = DEFAULT_BASE_API_PORT)]
    pub base_api_port: u16,

    /// Starting stream proxy port for child processes.
    #[arg(long, default_value_t = DEFAULT_BASE_STREAM_PORT)]
    pub base_stream_port: u16,

    /// Starting browser debug port for child processes.
    #[arg(long, default_value_t = DEFAULT_BASE_DEBUG_PORT)]
    pub base_debug_port: u16,

    /// Increment applied between successive child port assignments.
    #[arg(long, default_value_t = DEFAULT_PORT_STEP)]
    pub port_step: u16,

    /// Host interface for the coordinator HTTP server.
    #[arg(long, default_value = DEFAULT_COORDINATOR_HOST)]
    pub coordinator_host: String,

    /// Port for the coordinator HTTP server.
    #[arg(long, default_value_t = DEFAULT_COORDINATOR_PORT)]
    pub coordinator_port: u16,

    /// Directory for coordinator-managed child log files.
    #[arg(long, default_value = "logs/coordinator")]
    pub log_dir: PathBuf,

    /// Disable headless mode when launching child processes.
    #[arg(long)]
    pub no_headless: bool,

    /// Command used to launch each child server.
    #[arg(long, default_value = "./child-proxy")]
    pub child_command: PathBuf,
}
