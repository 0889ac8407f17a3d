use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to open terminal device {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("{path} is not a terminal")]
    NotATerminal { path: PathBuf },
    #[error("terminal {op} failed: {source}")]
    Ioctl { op: &'static str, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure of the cursor-position round trip. Callers carry on without a position.
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("malformed cursor position report {0:?}")]
    Protocol(String),
    #[error("no cursor position report within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("failed to subscribe to {source_id}: {reason}")]
    Open { source_id: String, reason: String },
    #[error("live stream for {source_id} failed: {reason}")]
    Stream { source_id: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("no log sources found{}", format_failures(.failures))]
    NoSources { failures: Vec<String> },
    #[error("profile {profile}: {reason}")]
    Profile { profile: String, reason: String },
}

fn format_failures(failures: &[String]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!(" ({})", failures.join("; "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PreferencesError {
    #[error("failed to read preferences {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse preferences {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::CatalogError;

    #[test]
    fn no_sources_lists_profile_failures() {
        let empty = CatalogError::NoSources { failures: vec![] };
        assert_eq!(empty.to_string(), "no log sources found");

        let failed = CatalogError::NoSources {
            failures: vec!["profile a: denied".into(), "profile b: missing".into()],
        };
        assert_eq!(
            failed.to_string(),
            "no log sources found (profile a: denied; profile b: missing)"
        );
    }
}
