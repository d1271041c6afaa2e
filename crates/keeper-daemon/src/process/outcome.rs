use keeper_core::{ManagedProcess, ProcessLogs, ProcessStatus};
use serde::Serialize;

/// Decides whether a finished command succeeded.
///
/// Exit codes reported by some managed sub-commands are not trustworthy, so
/// success is a pluggable judgement rather than `exit_code == 0`.
pub trait SuccessPredicate: Send + Sync {
    fn is_success(&self, process: &ManagedProcess, logs: &ProcessLogs) -> bool;
}

/// Default fallback chain. A command succeeded if any of:
/// 1. it exited with code 0
/// 2. it is `completed` without reporting an exit code
/// 3. its combined output contains one of the keywords (case-insensitive)
///
/// This is a deliberately weak contract; keyword hits can mask real failures.
#[derive(Debug, Clone, Default)]
pub struct KeywordSuccess {
    keywords: Vec<String>,
}

impl KeywordSuccess {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

impl SuccessPredicate for KeywordSuccess {
    fn is_success(&self, process: &ManagedProcess, logs: &ProcessLogs) -> bool {
        if process.exit_code == Some(0) {
            return true;
        }
        if process.status == ProcessStatus::Completed && process.exit_code.is_none() {
            return true;
        }
        if self.keywords.is_empty() {
            return false;
        }
        let output = format!("{}\n{}", logs.stdout, logs.stderr).to_lowercase();
        self.keywords.iter().any(|k| output.contains(k.as_str()))
    }
}

/// Evaluated result of a one-shot command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn evaluate(
        process: &ManagedProcess,
        logs: ProcessLogs,
        predicate: &dyn SuccessPredicate,
    ) -> Self {
        let success = predicate.is_success(process, &logs);
        let error = if success {
            None
        } else {
            Some(failure_message(process, &logs))
        };
        Self {
            success,
            status: process.status,
            exit_code: process.exit_code,
            stdout: logs.stdout,
            stderr: logs.stderr,
            error,
        }
    }
}

/// Prefer stderr, then stdout, then a synthesized description.
fn failure_message(process: &ManagedProcess, logs: &ProcessLogs) -> String {
    let stderr = logs.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = logs.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    match process.exit_code {
        Some(code) => format!("command failed ({}, exit code {})", process.status, code),
        None => format!("command failed ({}, no exit code)", process.status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(status: ProcessStatus, exit_code: Option<i32>) -> ManagedProcess {
        ManagedProcess {
            id: "p".into(),
            command: "gateway devices approve".into(),
            status,
            exit_code,
        }
    }

    fn logs(stdout: &str, stderr: &str) -> ProcessLogs {
        ProcessLogs {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn test_exit_code_zero_succeeds() {
        let outcome = CommandOutcome::evaluate(
            &process(ProcessStatus::Failed, Some(0)),
            logs("", "warning"),
            &KeywordSuccess::default(),
        );
        assert!(outcome.success);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_completed_without_exit_code_succeeds() {
        let outcome = CommandOutcome::evaluate(
            &process(ProcessStatus::Completed, None),
            logs("", ""),
            &KeywordSuccess::default(),
        );
        assert!(outcome.success);
    }

    #[test]
    fn test_keyword_rescues_bad_exit_code() {
        let predicate = KeywordSuccess::new(["Approved"]);
        let outcome = CommandOutcome::evaluate(
            &process(ProcessStatus::Failed, Some(1)),
            logs("Device APPROVED for pairing", ""),
            &predicate,
        );
        assert!(outcome.success);

        let outcome = CommandOutcome::evaluate(
            &process(ProcessStatus::Failed, Some(1)),
            logs("nothing to see", ""),
            &predicate,
        );
        assert!(!outcome.success);
    }

    #[test]
    fn test_blank_keywords_never_match() {
        let predicate = KeywordSuccess::new(["", "  "]);
        assert!(!predicate.is_success(&process(ProcessStatus::Failed, Some(2)), &logs("x", "y")));
    }

    #[test]
    fn test_failure_message_preference() {
        let predicate = KeywordSuccess::default();
        let failed = process(ProcessStatus::Failed, Some(2));

        let outcome = CommandOutcome::evaluate(&failed, logs(" out ", " err \n"), &predicate);
        assert_eq!(outcome.error.as_deref(), Some("err"));

        let outcome = CommandOutcome::evaluate(&failed, logs(" out \n", "   "), &predicate);
        assert_eq!(outcome.error.as_deref(), Some("out"));

        let outcome = CommandOutcome::evaluate(&failed, logs("", ""), &predicate);
        assert_eq!(
            outcome.error.as_deref(),
            Some("command failed (failed, exit code 2)")
        );

        let outcome =
            CommandOutcome::evaluate(&process(ProcessStatus::Error, None), logs("", ""), &predicate);
        assert_eq!(
            outcome.error.as_deref(),
            Some("command failed (error, no exit code)")
        );
    }
}
