use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::{DirEntry, WalkDir};

/// A local directory mirrored to one remote prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedTree {
    pub local: PathBuf,
    pub prefix: String,
}

impl TrackedTree {
    pub fn new(local: PathBuf, prefix: &str) -> Self {
        Self {
            local,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }
}

/// Where each tracked tree lives locally and remotely.
///
/// Excluded directory names only apply to the workspace tree. Config and
/// extensions are mirrored whole.
#[derive(Debug, Clone)]
pub struct Layout {
    pub config: TrackedTree,
    pub config_file: String,
    pub legacy_prefix: String,
    pub legacy_config_file: String,
    pub workspace: TrackedTree,
    pub extensions: TrackedTree,
    pub excludes: Vec<String>,
}

impl Layout {
    /// Every tracked tree with the excludes applied to it, in sync order.
    pub fn trees(&self) -> [(&TrackedTree, &[String]); 3] {
        let whole: &[String] = &[];
        [
            (&self.config, whole),
            (&self.workspace, self.excludes.as_slice()),
            (&self.extensions, whole),
        ]
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.config.local.join(&self.config_file)
    }

    pub fn legacy_config_file_path(&self) -> PathBuf {
        self.config.local.join(&self.legacy_config_file)
    }

    /// Whether there is local state worth protecting from a remote restore.
    ///
    /// Blocking: walks the workspace and extensions trees.
    pub fn has_local_state(&self) -> bool {
        if self.config_file_path().is_file() {
            return true;
        }
        if walk(&self.workspace.local, &self.excludes)
            .any(|e| e.file_type().is_file())
        {
            return true;
        }
        walk(&self.extensions.local, &[]).any(|e| e.file_type().is_file())
    }

    /// Whether anything under the tracked trees was modified at or after
    /// `watermark`. Directories count too, so deletions are noticed through
    /// their parent's mtime. Without a watermark any existing file counts.
    ///
    /// Blocking: walks every tracked tree.
    pub fn changed_since(&self, watermark: Option<SystemTime>) -> bool {
        self.trees().into_iter().any(|(tree, excludes)| {
            walk(&tree.local, excludes).any(|entry| match watermark {
                None => entry.file_type().is_file(),
                Some(mark) => entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .is_some_and(|modified| modified >= mark),
            })
        })
    }
}

/// Entries under `root`, skipping directories named in `excludes` and
/// unreadable entries. A missing root yields nothing.
fn walk<'a>(root: &Path, excludes: &'a [String]) -> impl Iterator<Item = DirEntry> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |e| !is_excluded(e, excludes))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                if err.depth() > 0 {
                    tracing::debug!("Error in walkdir: {err}");
                }
                None
            }
        })
}

fn is_excluded(entry: &DirEntry, excludes: &[String]) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && excludes.iter().any(|x| entry.file_name() == x.as_str())
}
