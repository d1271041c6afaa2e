use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use keeper_core::{ProbeOutcome, RemoteStore};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::{diagnostic_tail, StorageError};
use crate::remote::classify::classify_listing;

/// Name of the rclone remote defined through `RCLONE_CONFIG_*` variables.
const REMOTE_NAME: &str = "r2";

/// Flags applied to every transfer: bounded concurrency, fast listing, no
/// bucket existence pre-check, bounded retries with backoff.
const TRANSFER_FLAGS: &[&str] = &[
    "--transfers=16",
    "--checkers=16",
    "--fast-list",
    "--s3-no-check-bucket",
    "--retries=3",
    "--low-level-retries=10",
    "--retries-sleep=2s",
];

/// Connection settings for the R2 bucket.
#[derive(Clone)]
pub struct RcloneSettings {
    pub binary: String,
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for RcloneSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RcloneSettings")
            .field("binary", &self.binary)
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

/// Remote store driving the `rclone` CLI against an R2 bucket.
///
/// Each call runs one rclone subprocess. The subprocess is killed if the
/// calling future is dropped, so a timed-out sync does not linger.
#[derive(Debug, Clone)]
pub struct RcloneRemote {
    settings: RcloneSettings,
}

impl RcloneRemote {
    /// Create a new RcloneRemote.
    pub fn new(settings: RcloneSettings) -> Self {
        Self { settings }
    }

    /// `r2:{bucket}/{prefix}/`
    fn remote_path(&self, prefix: &str) -> String {
        format!(
            "{}:{}/{}/",
            REMOTE_NAME,
            self.settings.bucket,
            prefix.trim_matches('/')
        )
    }

    fn env(&self) -> Vec<(String, String)> {
        let var = |key: &str| format!("RCLONE_CONFIG_{}_{}", REMOTE_NAME.to_uppercase(), key);
        vec![
            (var("TYPE"), "s3".to_string()),
            (var("PROVIDER"), "Cloudflare".to_string()),
            (var("ACCESS_KEY_ID"), self.settings.access_key_id.clone()),
            (var("SECRET_ACCESS_KEY"), self.settings.secret_access_key.clone()),
            (var("ENDPOINT"), self.settings.endpoint.clone()),
            (var("ACL"), "private".to_string()),
        ]
    }

    fn probe_args(&self, prefix: &str) -> Vec<String> {
        vec![
            "lsf".to_string(),
            "--max-depth=1".to_string(),
            "--fast-list".to_string(),
            self.remote_path(prefix),
        ]
    }

    fn pull_args(&self, prefix: &str, local_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "copy".to_string(),
            self.remote_path(prefix),
            local_dir.display().to_string(),
        ];
        args.extend(TRANSFER_FLAGS.iter().map(|f| f.to_string()));
        args
    }

    fn push_args(&self, local_dir: &Path, prefix: &str, excludes: &[String]) -> Vec<String> {
        let mut args = vec![
            "sync".to_string(),
            format!("{}/", local_dir.display()),
            self.remote_path(prefix),
        ];
        args.extend(TRANSFER_FLAGS.iter().map(|f| f.to_string()));
        for exclude in excludes {
            args.push(format!("--exclude={}/**", exclude));
        }
        args
    }

    async fn run(&self, args: &[String]) -> Result<Output, StorageError> {
        debug!("rclone {}", args.join(" "));
        Command::new(&self.settings.binary)
            .args(args)
            .envs(self.env())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                StorageError::Remote(format!("Failed to run {}: {}", self.settings.binary, e))
            })
    }

    fn check(output: &Output, what: &str) -> Result<(), StorageError> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(StorageError::Remote(format!(
            "{} failed ({}): {}",
            what,
            output.status,
            diagnostic_tail(&stderr, 1024)
        )))
    }
}

#[async_trait]
impl RemoteStore for RcloneRemote {
    #[instrument(skip(self), level = "debug")]
    async fn probe(&self, prefix: &str) -> ProbeOutcome {
        let output = match self.run(&self.probe_args(prefix)).await {
            Ok(output) => output,
            Err(e) => return ProbeOutcome::Error(e.to_string()),
        };
        let outcome = classify_listing(
            output.status.success(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        );
        debug!("Probe of {} -> {:?}", prefix, outcome);
        outcome
    }

    #[instrument(skip(self), level = "debug")]
    async fn pull(&self, prefix: &str, local_dir: &Path) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(local_dir).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to create {}: {}",
                local_dir.display(),
                e
            ))
        })?;
        let output = self.run(&self.pull_args(prefix, local_dir)).await?;
        Self::check(&output, &format!("copy of {}", prefix))?;
        info!("Restored {} into {}", prefix, local_dir.display());
        Ok(())
    }

    #[instrument(skip(self, excludes), level = "debug")]
    async fn push(
        &self,
        local_dir: &Path,
        prefix: &str,
        excludes: &[String],
    ) -> Result<(), StorageError> {
        if !tokio::fs::try_exists(local_dir).await.unwrap_or(false) {
            warn!("Skipping push of missing directory {}", local_dir.display());
            return Ok(());
        }
        let output = self
            .run(&self.push_args(local_dir, prefix, excludes))
            .await?;
        Self::check(&output, &format!("sync of {}", prefix))?;
        debug!("Pushed {} to {}", local_dir.display(), prefix);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn remote(binary: &str) -> RcloneRemote {
        RcloneRemote::new(RcloneSettings {
            binary: binary.into(),
            endpoint: "https://acct.r2.cloudflarestorage.com".into(),
            bucket: "gateway-data".into(),
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
        })
    }

    #[test]
    fn test_remote_path_normalizes_slashes() {
        let remote = remote("rclone");
        assert_eq!(remote.remote_path("/workspace/"), "r2:gateway-data/workspace/");
    }

    #[test]
    fn test_push_args_carry_flag_profile_and_excludes() {
        let remote = remote("rclone");
        let args = remote.push_args(
            &PathBuf::from("/home/user/workspace"),
            "workspace",
            &[".git".into(), "node_modules".into()],
        );
        assert_eq!(
            args[..3],
            ["sync", "/home/user/workspace/", "r2:gateway-data/workspace/"]
        );
        for flag in TRANSFER_FLAGS {
            assert!(args.iter().any(|a| a == flag), "missing {}", flag);
        }
        assert!(args.contains(&"--exclude=.git/**".to_string()));
        assert!(args.contains(&"--exclude=node_modules/**".to_string()));
    }

    #[test]
    fn test_env_defines_remote() {
        let env = remote("rclone").env();
        assert!(env.contains(&("RCLONE_CONFIG_R2_TYPE".into(), "s3".into())));
        assert!(env.contains(&(
            "RCLONE_CONFIG_R2_ENDPOINT".into(),
            "https://acct.r2.cloudflarestorage.com".into()
        )));
    }

    #[test]
    fn test_debug_hides_credentials() {
        let debug = format!("{:?}", remote("rclone").settings);
        assert!(!debug.contains("secret"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_probe_error() {
        let remote = remote("/definitely/not/rclone");
        assert!(matches!(remote.probe("config").await, ProbeOutcome::Error(_)));

        let temp = tempfile::TempDir::new().unwrap();
        let err = remote.push(temp.path(), "config", &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::Remote(_)));
    }
}
