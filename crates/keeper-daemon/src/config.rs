use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use keeper_core::StartOptions;

use crate::process::GatewaySpec;
use crate::remote::RcloneSettings;
use crate::status::StatusStore;
use crate::sync::{Layout, TrackedTree};

/// Command line for the keeper daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "keeper-daemon")]
#[command(about = "Keeps the sandbox gateway alive and its state backed up to R2")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Restore, start the gateway, sync until terminated (default)
    Serve,
    /// Print the persisted restore and sync records as JSON
    Status,
    /// Run one manual sync now
    Sync,
    /// Restore from remote on the next boot even if local state exists
    ForceRestore,
    /// Run a one-shot command in the sandbox and print its evaluated outcome
    Exec {
        /// Give up waiting after this many milliseconds
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,

        /// Output text that counts as success even without a clean exit code
        #[arg(long = "success-keyword")]
        success_keywords: Vec<String>,

        /// Program and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

/// Configuration shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Directory holding status records, the sync log, markers and the lock file
    #[arg(long, global = true, env = "KEEPER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Cloudflare account ID (R2 endpoint)
    #[arg(long, env = "CF_ACCOUNT_ID")]
    pub cloudflare_account_id: Option<String>,

    /// R2 access key ID (S3-compatible API)
    #[arg(long, env = "R2_ACCESS_KEY_ID")]
    pub r2_access_key_id: Option<String>,

    /// R2 secret access key (S3-compatible API)
    #[arg(long, env = "R2_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub r2_secret_access_key: Option<String>,

    /// R2 bucket holding the backup
    #[arg(long, default_value = "gateway-data", env = "R2_BUCKET_NAME")]
    pub r2_bucket_name: String,

    /// rclone binary used for transfers
    #[arg(long, default_value = "rclone", env = "RCLONE_BINARY")]
    pub rclone_binary: String,

    /// Gateway configuration directory
    #[arg(long, env = "GATEWAY_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Primary config file name inside the config directory
    #[arg(long, default_value = "gateway.json", env = "GATEWAY_CONFIG_FILE")]
    pub config_file: String,

    /// Config file name used by the legacy backup layout
    #[arg(long, default_value = "config.json", env = "GATEWAY_LEGACY_CONFIG_FILE")]
    pub legacy_config_file: String,

    /// Agent workspace directory
    #[arg(long, env = "GATEWAY_WORKSPACE_DIR")]
    pub workspace_dir: Option<PathBuf>,

    /// Installed extensions directory
    #[arg(long, env = "GATEWAY_EXTENSIONS_DIR")]
    pub extensions_dir: Option<PathBuf>,

    /// Remote prefix for the config tree
    #[arg(long, default_value = "config", env = "BACKUP_CONFIG_PREFIX")]
    pub config_prefix: String,

    /// Remote prefix of the legacy combined backup (restore only)
    #[arg(long, default_value = "legacy", env = "BACKUP_LEGACY_PREFIX")]
    pub legacy_prefix: String,

    /// Remote prefix for the workspace tree
    #[arg(long, default_value = "workspace", env = "BACKUP_WORKSPACE_PREFIX")]
    pub workspace_prefix: String,

    /// Remote prefix for the extensions tree
    #[arg(long, default_value = "extensions", env = "BACKUP_EXTENSIONS_PREFIX")]
    pub extensions_prefix: String,

    /// Directory names never synced or counted as local state
    #[arg(
        long,
        value_delimiter = ',',
        default_value = ".git,node_modules,.cache,tmp",
        env = "BACKUP_EXCLUDES"
    )]
    pub exclude: Vec<String>,

    /// Seconds between change scans
    #[arg(long, default_value = "30", env = "SYNC_SCAN_INTERVAL")]
    pub sync_scan_interval_secs: u64,

    /// Maximum seconds between successful syncs regardless of changes
    #[arg(long, default_value = "300", env = "SYNC_FORCE_INTERVAL")]
    pub sync_force_interval_secs: u64,

    /// Upper bound for the final sync on shutdown
    #[arg(long, default_value = "45", env = "SHUTDOWN_SYNC_TIMEOUT")]
    pub shutdown_sync_timeout_secs: u64,

    /// Size in KiB at which the sync activity log is trimmed to its newer half
    #[arg(long, default_value = "256", env = "SYNC_LOG_MAX_KB")]
    pub sync_log_max_kb: u64,

    /// Gateway program; no gateway is managed when unset
    #[arg(long, env = "GATEWAY_COMMAND")]
    pub gateway_command: Option<String>,

    /// Gateway argument (repeatable)
    #[arg(long = "gateway-arg", allow_hyphen_values = true)]
    pub gateway_args: Vec<String>,

    /// Substring identifying the gateway in process listings (defaults to the command line)
    #[arg(long, env = "GATEWAY_MATCH")]
    pub gateway_match: Option<String>,

    /// Port the gateway listens on once ready
    #[arg(long, env = "GATEWAY_PORT")]
    pub gateway_port: Option<u16>,

    /// Seconds to wait for the gateway to become ready
    #[arg(long, default_value = "180", env = "GATEWAY_STARTUP_TIMEOUT")]
    pub gateway_startup_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when stopping the gateway
    #[arg(long, default_value = "10", env = "GATEWAY_STOP_GRACE")]
    pub gateway_stop_grace_secs: u64,

    /// Interval between process status polls
    #[arg(long, default_value = "500", env = "PROCESS_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    /// Attempts per sandbox operation across handle invalidation
    #[arg(long, default_value = "3", env = "HANDLE_RETRY_ATTEMPTS")]
    pub handle_retry_attempts: u32,
}

impl Config {
    /// Get the effective state directory.
    pub fn effective_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sandbox-keeper")
        })
    }

    fn home_dir() -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Get the effective gateway config directory.
    pub fn effective_config_dir(&self) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| Self::home_dir().join(".gateway"))
    }

    /// Get the effective workspace directory.
    pub fn effective_workspace_dir(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .unwrap_or_else(|| Self::home_dir().join("workspace"))
    }

    /// Get the effective extensions directory.
    pub fn effective_extensions_dir(&self) -> PathBuf {
        self.extensions_dir
            .clone()
            .unwrap_or_else(|| Self::home_dir().join("extensions"))
    }

    /// rclone settings, or `None` when any R2 credential is missing.
    pub fn rclone_settings(&self) -> Option<RcloneSettings> {
        let account_id = non_empty(&self.cloudflare_account_id)?;
        let access_key_id = non_empty(&self.r2_access_key_id)?;
        let secret_access_key = non_empty(&self.r2_secret_access_key)?;
        if self.r2_bucket_name.trim().is_empty() {
            return None;
        }

        Some(RcloneSettings {
            binary: self.rclone_binary.clone(),
            endpoint: format!("https://{}.r2.cloudflarestorage.com", account_id),
            bucket: self.r2_bucket_name.clone(),
            access_key_id,
            secret_access_key,
        })
    }

    /// Local/remote layout of the tracked trees.
    pub fn layout(&self) -> Layout {
        let config_dir = self.effective_config_dir();
        Layout {
            config: TrackedTree::new(config_dir.clone(), &self.config_prefix),
            config_file: self.config_file.clone(),
            legacy_prefix: self.legacy_prefix.clone(),
            legacy_config_file: self.legacy_config_file.clone(),
            workspace: TrackedTree::new(self.effective_workspace_dir(), &self.workspace_prefix),
            extensions: TrackedTree::new(
                self.effective_extensions_dir(),
                &self.extensions_prefix,
            ),
            excludes: self
                .exclude
                .iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// How to run the gateway, or `None` when no gateway command is configured.
    pub fn gateway_spec(&self) -> Option<GatewaySpec> {
        let program = non_empty(&self.gateway_command)?;
        let start = StartOptions::new(program).args(&self.gateway_args);
        let match_pattern = non_empty(&self.gateway_match).unwrap_or_else(|| start.command_line());
        Some(GatewaySpec {
            start,
            match_pattern,
            ready_port: self.gateway_port,
            startup_timeout: Duration::from_secs(self.gateway_startup_timeout_secs),
            stop_grace: Duration::from_secs(self.gateway_stop_grace_secs),
        })
    }

    pub fn sync_scan_interval(&self) -> Duration {
        Duration::from_secs(self.sync_scan_interval_secs.max(1))
    }

    pub fn sync_force_interval(&self) -> Duration {
        Duration::from_secs(self.sync_force_interval_secs)
    }

    pub fn shutdown_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_sync_timeout_secs)
    }

    /// Status store for the effective state dir, with the configured log cap.
    pub fn status_store(&self) -> StatusStore {
        StatusStore::new(self.effective_state_dir()).with_log_limit(self.sync_log_max_kb * 1024)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["keeper-daemon"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_remote_requires_all_credentials() {
        let cli = parse(&["--cloudflare-account-id", "acct", "--r2-access-key-id", "key"]);
        assert!(cli.config.rclone_settings().is_none());

        let cli = parse(&[
            "--cloudflare-account-id",
            "acct",
            "--r2-access-key-id",
            "key",
            "--r2-secret-access-key",
            "secret",
        ]);
        let settings = cli.config.rclone_settings().unwrap();
        assert_eq!(settings.endpoint, "https://acct.r2.cloudflarestorage.com");
        assert_eq!(settings.bucket, "gateway-data");
    }

    #[test]
    fn test_blank_credentials_count_as_missing() {
        let cli = parse(&[
            "--cloudflare-account-id",
            "acct",
            "--r2-access-key-id",
            "  ",
            "--r2-secret-access-key",
            "secret",
        ]);
        assert!(cli.config.rclone_settings().is_none());
    }

    #[test]
    fn test_layout_excludes_and_prefixes() {
        let cli = parse(&["--config-dir", "/cfg", "--exclude", ".git, node_modules,,"]);
        let layout = cli.config.layout();
        assert_eq!(layout.config.local, PathBuf::from("/cfg"));
        assert_eq!(layout.config.prefix, "config");
        assert_eq!(layout.legacy_prefix, "legacy");
        assert_eq!(layout.excludes, vec![".git".to_string(), "node_modules".to_string()]);
    }

    #[test]
    fn test_exec_subcommand() {
        let cli = parse(&["exec", "--success-keyword", "approved", "--", "gateway", "devices", "approve"]);
        match cli.command {
            Some(Command::Exec {
                timeout_ms,
                success_keywords,
                command,
            }) => {
                assert_eq!(timeout_ms, 30000);
                assert_eq!(success_keywords, vec!["approved".to_string()]);
                assert_eq!(command, vec!["gateway", "devices", "approve"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_gateway_spec() {
        assert!(parse(&[]).config.gateway_spec().is_none());

        let cli = parse(&[
            "--gateway-command",
            "gateway",
            "--gateway-arg",
            "serve",
            "--gateway-arg",
            "--port=18789",
            "--gateway-port",
            "18789",
        ]);
        let spec = cli.config.gateway_spec().unwrap();
        assert_eq!(spec.match_pattern, "gateway serve --port=18789");
        assert_eq!(spec.ready_port, Some(18789));
        assert_eq!(spec.startup_timeout, Duration::from_secs(180));
        assert_eq!(spec.stop_grace, Duration::from_secs(10));

        let cli = parse(&["--gateway-command", "gateway", "--gateway-match", "gateway serve"]);
        assert_eq!(cli.config.gateway_spec().unwrap().match_pattern, "gateway serve");
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config.sync_scan_interval(), Duration::from_secs(30));
        assert_eq!(cli.config.sync_force_interval(), Duration::from_secs(300));
        assert_eq!(cli.config.shutdown_sync_timeout(), Duration::from_secs(45));
        assert_eq!(cli.config.poll_interval(), Duration::from_millis(500));
        assert_eq!(cli.config.handle_retry_attempts, 3);
        assert_eq!(cli.config.sync_log_max_kb, 256);
    }
}
