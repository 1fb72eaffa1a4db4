use crate::models::ErrorCategory;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

fn compile_set(patterns: &[&str]) -> RegexSet {
    RegexSet::new(patterns.iter().map(|pattern| format!("(?i){}", pattern))).expect("valid classifier regex")
}

/// Priority order. Classification returns the first category whose set matches.
static CATEGORY_PATTERNS: Lazy<Vec<(ErrorCategory, RegexSet)>> = Lazy::new(|| {
    vec![
        (
            ErrorCategory::Install,
            compile_set(&[
                r"npm ERR!",
                r"ERESOLVE",
                r"ETARGET",
                r"ENOTFOUND",
                r"ETIMEDOUT",
                r"network",
                r"proxy",
            ]),
        ),
        (
            ErrorCategory::Dependency,
            compile_set(&[
                r"Failed to resolve import",
                r"Cannot find module",
                r"Module not found",
                r"Could not resolve",
            ]),
        ),
        (
            ErrorCategory::Export,
            compile_set(&[
                r"does not provide an export",
                r"is not exported",
                r"export.*not found",
                r"has no exported member",
            ]),
        ),
        (
            ErrorCategory::Build,
            compile_set(&[
                r"Failed to parse source",
                r"SyntaxError",
                r"ts\(\d+\)",
                r"\[vite\].*error",
                r"\[vite\].*failed",
                r"Internal server error",
                r"Failed to load module script",
                r"Build failed",
                r"Transform failed",
            ]),
        ),
        (
            ErrorCategory::Runtime,
            compile_set(&[
                r"TypeError",
                r"ReferenceError",
                r"Cannot read properties",
                r"Uncaught",
                r"is not a function",
                r"is undefined",
            ]),
        ),
    ]
});

static INSTALL_LINE_FILTER: Lazy<RegexSet> =
    Lazy::new(|| compile_set(&[r"npm ERR!", r"ERESOLVE", r"ETARGET", r"ENOTFOUND", r"ETIMEDOUT", r"EACCES"]));

static DEV_LINE_FILTER: Lazy<RegexSet> = Lazy::new(|| {
    compile_set(&[
        r"Failed to resolve",
        r"SyntaxError",
        r"ENOENT",
        r"\[vite\] Internal server error",
        r"Failed to parse source",
        r"Transform failed",
        r"Cannot find module",
    ])
});

static NETWORK_OUTPUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ETIMEDOUT|ENOTFOUND|proxy|network").expect("valid network regex"));

/// Maps a raw log or console line to an error category.
pub fn classify(message: &str) -> ErrorCategory {
    CATEGORY_PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.is_match(message))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Runtime)
}

pub fn is_install_error(line: &str) -> bool {
    INSTALL_LINE_FILTER.is_match(line)
}

pub fn is_dev_error(line: &str) -> bool {
    DEV_LINE_FILTER.is_match(line)
}

/// Captured install output that points at connectivity rather than the package graph.
pub fn is_network_failure(output: &str) -> bool {
    NETWORK_OUTPUT.is_match(output)
}

pub fn is_memory_error(message: &str) -> bool {
    message.contains("memory") || message.contains("Out of memory") || message.contains("Cannot allocate")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Unsupported,
    OutOfMemory,
    Network,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    Retry,
    ForceCleanupAndRetry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureNotice {
    pub kind: FailureKind,
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub actions: Vec<RecoveryAction>,
}

fn kind_of(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("host_unsupported") || lower.contains("not supported") || lower.contains("unsupported") {
        return FailureKind::Unsupported;
    }
    if lower.contains("memory") {
        return FailureKind::OutOfMemory;
    }
    if lower.contains("network") || message.contains("ETIMEDOUT") || lower.contains("proxy") {
        return FailureKind::Network;
    }
    FailureKind::Generic
}

/// Turns a run failure message into what the UI shows. Heuristic: the host
/// exposes no typed error codes, so the kind is inferred from the text.
pub fn describe_failure(message: &str) -> FailureNotice {
    let kind = kind_of(message);
    let (title, suggestions, actions): (&str, &[&str], Vec<RecoveryAction>) = match kind {
        FailureKind::Unsupported => (
            "Preview host not supported",
            &[
                "Install Node.js 18+ so that `npm` is on PATH",
                "Use a desktop environment; the sandbox cannot run here",
            ],
            vec![],
        ),
        FailureKind::OutOfMemory => (
            "Sandbox ran out of memory",
            &[
                "Close other memory-heavy applications",
                "Restart the preview host to release cached memory",
                "Make sure the machine has at least 8GB of free memory",
            ],
            vec![RecoveryAction::Retry, RecoveryAction::ForceCleanupAndRetry],
        ),
        FailureKind::Network => (
            "Network connection failed",
            &[
                "Check that the internet is reachable",
                "Retry; transient network errors are common",
                "Disable VPN or proxy settings that may block the npm registry",
                "Check firewall rules for outgoing registry traffic",
            ],
            vec![RecoveryAction::Retry],
        ),
        FailureKind::Generic => ("Preview failed to start", &[], vec![RecoveryAction::Retry]),
    };

    FailureNotice {
        kind,
        title: title.to_string(),
        message: message.to_string(),
        suggestions: suggestions.iter().map(|item| (*item).to_string()).collect(),
        actions,
    }
}

#[cfg(test)]
mod tests {
    use super::{classify, describe_failure, is_dev_error, is_install_error, is_network_failure, FailureKind, RecoveryAction};
    use crate::models::ErrorCategory;

    #[test]
    fn install_outranks_runtime() {
        assert_eq!(
            classify("npm ERR! TypeError: cannot read version"),
            ErrorCategory::Install
        );
    }

    #[test]
    fn classifies_each_category() {
        assert_eq!(classify("Failed to resolve import \"zustand\""), ErrorCategory::Dependency);
        assert_eq!(
            classify("The requested module does not provide an export named 'Card'"),
            ErrorCategory::Export
        );
        assert_eq!(classify("[vite] Internal server error: boom"), ErrorCategory::Build);
        assert_eq!(classify("error TS2304 at ts(2304)"), ErrorCategory::Build);
        assert_eq!(classify("Uncaught ReferenceError: x"), ErrorCategory::Runtime);
    }

    #[test]
    fn dependency_outranks_build() {
        assert_eq!(
            classify("[vite] error: Failed to resolve import \"./missing\""),
            ErrorCategory::Dependency
        );
    }

    #[test]
    fn unknown_lines_default_to_runtime() {
        assert_eq!(classify("something odd happened"), ErrorCategory::Runtime);
        assert_eq!(classify(""), ErrorCategory::Runtime);
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(classify("NETWORK unreachable"), ErrorCategory::Install);
        assert_eq!(classify("typeerror: x is not a function"), ErrorCategory::Runtime);
    }

    #[test]
    fn noise_filters_keep_only_diagnostic_lines() {
        assert!(is_install_error("npm ERR! code ERESOLVE"));
        assert!(is_install_error("npm error ETIMEDOUT fetching"));
        assert!(!is_install_error("added 212 packages in 9s"));

        assert!(is_dev_error("Failed to resolve import \"./x\" from \"src/App.tsx\""));
        assert!(is_dev_error("SyntaxError: Unexpected token"));
        assert!(is_dev_error("ENOENT: no such file or directory"));
        assert!(!is_dev_error("  VITE v5.0.0  ready in 300 ms"));
    }

    #[test]
    fn network_output_detection() {
        assert!(is_network_failure("npm ERR! code ETIMEDOUT"));
        assert!(is_network_failure("request to registry failed, reason: getaddrinfo ENOTFOUND"));
        assert!(!is_network_failure("npm ERR! code ERESOLVE"));
    }

    #[test]
    fn failure_notices_follow_message_text() {
        let memory = describe_failure("OUT_OF_MEMORY: sandbox ran out of memory twice");
        assert_eq!(memory.kind, FailureKind::OutOfMemory);
        assert!(memory.actions.contains(&RecoveryAction::ForceCleanupAndRetry));

        let network = describe_failure("INSTALL_FAILED: Network connection failed");
        assert_eq!(network.kind, FailureKind::Network);
        assert!(!network.suggestions.is_empty());

        let unsupported = describe_failure("HOST_UNSUPPORTED: npm is not available");
        assert_eq!(unsupported.kind, FailureKind::Unsupported);

        let generic = describe_failure("MOUNT_FAILED: package.json missing after mount");
        assert_eq!(generic.kind, FailureKind::Generic);
        assert_eq!(generic.actions, vec![RecoveryAction::Retry]);
    }
}
