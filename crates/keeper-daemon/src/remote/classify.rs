use keeper_core::ProbeOutcome;

use crate::error::diagnostic_tail;

/// Diagnostic phrases meaning "nothing there" rather than a real fault.
const NOT_FOUND_PHRASES: &[&str] = &[
    "directory not found",
    "object not found",
    "not found",
    "no such key",
    "nosuchkey",
    "no such file or directory",
    "does not exist",
    "doesn't exist",
    "404",
];

/// Turn the result of a listing command into a probe outcome.
///
/// A successful listing with any output means the prefix exists; an empty
/// listing means it is missing. A failed listing is missing only when its
/// diagnostic text matches a known not-found phrasing, otherwise it is a
/// hard error carrying the diagnostic tail.
pub fn classify_listing(success: bool, stdout: &str, stderr: &str) -> ProbeOutcome {
    if success {
        if stdout.trim().is_empty() {
            return ProbeOutcome::Missing;
        }
        return ProbeOutcome::Exists;
    }

    let diagnostic = stderr.to_lowercase();
    if NOT_FOUND_PHRASES.iter().any(|p| diagnostic.contains(p)) {
        return ProbeOutcome::Missing;
    }

    let detail = diagnostic_tail(stderr, 1024);
    if detail.is_empty() {
        ProbeOutcome::Error(String::from("listing failed without diagnostic output"))
    } else {
        ProbeOutcome::Error(detail)
    }
}
