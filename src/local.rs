//! File-backed catalog and live-tail subscriptions: every regular log file
//! under a profile root is a source, tailed from its end like `tail -f`,
//! rewinding on truncation.

use std::collections::HashSet;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::task::JoinSet;

use crate::error::{CatalogError, SubscriptionError};
use crate::prefs::Preferences;
use crate::source::{Catalog, LogSource, RawEvent, Subscriber, Subscription};

pub const FILE_SCHEME: &str = "file://";
pub const LOCAL_REGION: &str = "local";
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const MAX_BATCH_LINES: usize = 500;

const COMPRESSED_EXTENSIONS: [&str; 5] = ["gz", "xz", "zst", "bz2", "zip"];

#[derive(Debug, Clone)]
pub struct FileCatalog {
    roots: Vec<(String, PathBuf)>,
}

impl FileCatalog {
    pub fn new(roots: Vec<(String, PathBuf)>) -> Self {
        Self { roots }
    }

    pub fn from_preferences(prefs: &Preferences) -> Self {
        Self::new(prefs.profile_roots())
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn list_sources(
        &self,
        excluded_profiles: &[String],
    ) -> Result<Vec<LogSource>, CatalogError> {
        let mut scans = JoinSet::new();
        for (order, (profile, root)) in self.roots.iter().enumerate() {
            if excluded_profiles.contains(profile) {
                debug!("profile {profile} excluded");
                continue;
            }
            let profile = profile.clone();
            let root = root.clone();
            scans.spawn(async move { (order, scan_profile(&profile, &root).await) });
        }

        let mut scanned = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = scans.join_next().await {
            match joined {
                Ok((order, Ok(sources))) => scanned.push((order, sources)),
                Ok((_, Err(err))) => {
                    warn!("{err}");
                    failures.push(err.to_string());
                }
                Err(err) => failures.push(format!("profile scan failed: {err}")),
            }
        }
        scanned.sort_by_key(|(order, _)| *order);

        let mut seen = HashSet::new();
        let mut sources = scanned
            .into_iter()
            .flat_map(|(_, sources)| sources)
            .filter(|source| seen.insert(source.id.clone()))
            .collect::<Vec<_>>();
        if sources.is_empty() {
            return Err(CatalogError::NoSources { failures });
        }

        sources.sort_by(|a, b| {
            a.account_id
                .cmp(&b.account_id)
                .then_with(|| a.name.cmp(&b.name))
        });
        info!(
            "found {} log sources ({} profile failures)",
            sources.len(),
            failures.len()
        );
        Ok(sources)
    }
}

async fn scan_profile(profile: &str, root: &Path) -> Result<Vec<LogSource>, CatalogError> {
    let profile_error = |err: io::Error| CatalogError::Profile {
        profile: profile.to_owned(),
        reason: format!("{}: {err}", root.display()),
    };

    let mut sources = Vec::new();
    let mut subdirs = Vec::new();
    let mut entries = fs::read_dir(root).await.map_err(profile_error)?;
    while let Some(entry) = entries.next_entry().await.map_err(profile_error)? {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if file_type.is_dir() {
            subdirs.push(entry.path());
        } else if let Some(source) = file_source(profile, root, &entry.path()).await {
            sources.push(source);
        }
    }

    for dir in subdirs {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!("skipping {}: {err}", dir.display());
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.is_ok_and(|kind| kind.is_file())
                && let Some(source) = file_source(profile, root, &entry.path()).await
            {
                sources.push(source);
            }
        }
    }

    debug!("profile {profile} lists {} files", sources.len());
    Ok(sources)
}

async fn file_source(profile: &str, root: &Path, path: &Path) -> Option<LogSource> {
    let compressed = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| COMPRESSED_EXTENSIONS.contains(&ext));
    if compressed {
        return None;
    }

    let canonical = fs::canonicalize(path).await.ok()?;
    if !fs::metadata(&canonical).await.ok()?.is_file() {
        return None;
    }

    let name = path.strip_prefix(root).unwrap_or(path);
    Some(LogSource {
        name: name.display().to_string(),
        id: format!("{FILE_SCHEME}{}", canonical.display()),
        account_id: root.display().to_string(),
        region: LOCAL_REGION.to_owned(),
        profile: profile.to_owned(),
    })
}

#[derive(Debug, Clone)]
pub struct FileSubscriber {
    poll_interval: Duration,
}

impl Default for FileSubscriber {
    fn default() -> Self {
        Self::with_poll_interval(POLL_INTERVAL)
    }
}

impl FileSubscriber {
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

#[async_trait]
impl Subscriber for FileSubscriber {
    async fn subscribe(
        &self,
        source: &LogSource,
    ) -> Result<Box<dyn Subscription>, SubscriptionError> {
        let open_error = |reason: String| SubscriptionError::Open {
            source_id: source.id.clone(),
            reason,
        };
        let path = source
            .id
            .strip_prefix(FILE_SCHEME)
            .map(PathBuf::from)
            .ok_or_else(|| open_error("not a file source".to_owned()))?;

        let mut file = File::open(&path)
            .await
            .map_err(|err| open_error(err.to_string()))?;
        let position = file
            .seek(SeekFrom::End(0))
            .await
            .map_err(|err| open_error(err.to_string()))?;

        debug!("tailing {} from byte {position}", path.display());
        Ok(Box::new(FileSubscription {
            source_id: source.id.clone(),
            path,
            reader: Some(BufReader::new(file)),
            position,
            pending: Vec::new(),
            poll_interval: self.poll_interval,
        }))
    }
}

/// Polls one file for complete lines appended after it was opened.
#[derive(Debug)]
pub struct FileSubscription {
    source_id: String,
    path: PathBuf,
    reader: Option<BufReader<File>>,
    position: u64,
    pending: Vec<u8>,
    poll_interval: Duration,
}

impl FileSubscription {
    fn stream_error(&self, err: io::Error) -> SubscriptionError {
        SubscriptionError::Stream {
            source_id: self.source_id.clone(),
            reason: err.to_string(),
        }
    }

    async fn rewind_if_truncated(&mut self) -> io::Result<()> {
        let len = fs::metadata(&self.path).await?.len();
        if len >= self.position {
            return Ok(());
        }
        if let Some(reader) = &mut self.reader {
            reader.seek(SeekFrom::Start(0)).await?;
        }
        info!("{} was truncated, reading from the start", self.path.display());
        self.position = 0;
        self.pending.clear();
        Ok(())
    }

    async fn read_lines(&mut self) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        let Some(reader) = &mut self.reader else {
            return Ok(lines);
        };

        while lines.len() < MAX_BATCH_LINES {
            let read = reader.read_until(b'\n', &mut self.pending).await?;
            if read == 0 {
                break;
            }
            self.position += read as u64;
            if self.pending.last() != Some(&b'\n') {
                break;
            }

            self.pending.pop();
            if self.pending.last() == Some(&b'\r') {
                self.pending.pop();
            }
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
        }

        Ok(lines)
    }
}

#[async_trait]
impl Subscription for FileSubscription {
    async fn receive(&mut self) -> Result<Option<Vec<RawEvent>>, SubscriptionError> {
        loop {
            if self.reader.is_none() {
                return Ok(None);
            }
            if let Err(err) = self.rewind_if_truncated().await {
                return Err(self.stream_error(err));
            }

            let lines = match self.read_lines().await {
                Ok(lines) => lines,
                Err(err) => return Err(self.stream_error(err)),
            };
            if !lines.is_empty() {
                let timestamp_millis = Utc::now().timestamp_millis();
                return Ok(Some(
                    lines
                        .into_iter()
                        .map(|message| RawEvent {
                            timestamp_millis,
                            message,
                        })
                        .collect(),
                ));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!("closed {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::time::Duration;

    use super::{FILE_SCHEME, FileCatalog, FileSubscriber, LOCAL_REGION};
    use crate::error::{CatalogError, SubscriptionError};
    use crate::source::{Catalog, LogSource, Subscriber};

    fn append(path: &std::path::Path, text: &str) {
        let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn file_source(path: &std::path::Path) -> LogSource {
        LogSource {
            name: "test.log".to_owned(),
            id: format!("{FILE_SCHEME}{}", path.display()),
            account_id: "root".to_owned(),
            region: LOCAL_REGION.to_owned(),
            profile: "default".to_owned(),
        }
    }

    #[tokio::test]
    async fn catalog_lists_plain_files_sorted_and_deduplicated() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(first.path().join("b.log"), "").unwrap();
        fs::write(first.path().join("a.log"), "").unwrap();
        fs::write(first.path().join("old.log.gz"), "").unwrap();
        fs::create_dir(first.path().join("nginx")).unwrap();
        fs::write(first.path().join("nginx").join("access.log"), "").unwrap();
        fs::write(second.path().join("c.log"), "").unwrap();

        let catalog = FileCatalog::new(vec![
            ("one".to_owned(), first.path().to_path_buf()),
            ("again".to_owned(), first.path().to_path_buf()),
            ("two".to_owned(), second.path().to_path_buf()),
        ]);
        let sources = catalog.list_sources(&[]).await.unwrap();

        let mut expected = vec![
            (first.path().display().to_string(), "a.log".to_owned()),
            (first.path().display().to_string(), "b.log".to_owned()),
            (
                first.path().display().to_string(),
                format!("nginx{}access.log", std::path::MAIN_SEPARATOR),
            ),
            (second.path().display().to_string(), "c.log".to_owned()),
        ];
        expected.sort();
        let listed = sources
            .iter()
            .map(|source| (source.account_id.clone(), source.name.clone()))
            .collect::<Vec<_>>();
        assert_eq!(listed, expected);
        assert!(sources.iter().all(|source| source.id.starts_with(FILE_SCHEME)));
        assert!(
            sources
                .iter()
                .filter(|source| source.account_id == first.path().display().to_string())
                .all(|source| source.profile == "one")
        );
    }

    #[tokio::test]
    async fn excluded_and_failing_profiles_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.log"), "").unwrap();
        let catalog = FileCatalog::new(vec![
            ("broken".to_owned(), dir.path().join("missing")),
            ("app".to_owned(), dir.path().to_path_buf()),
        ]);

        let sources = catalog.list_sources(&[]).await.unwrap();
        assert_eq!(sources.len(), 1);

        let err = catalog.list_sources(&["app".to_owned()]).await.unwrap_err();
        match err {
            CatalogError::NoSources { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("broken"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn subscription_delivers_only_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        fs::write(&path, "old line\n").unwrap();

        let subscriber = FileSubscriber::with_poll_interval(Duration::from_millis(5));
        let mut subscription = subscriber.subscribe(&file_source(&path)).await.unwrap();

        append(&path, "first\r\nsecond\npart");
        let batch = subscription.receive().await.unwrap().unwrap();
        let messages = batch.iter().map(|event| event.message.as_str()).collect::<Vec<_>>();
        assert_eq!(messages, vec!["first", "second"]);

        append(&path, "ial\n");
        let batch = subscription.receive().await.unwrap().unwrap();
        assert_eq!(batch[0].message, "partial");

        subscription.close().await;
        assert!(subscription.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_file_is_read_from_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        fs::write(&path, "a long line that will be truncated away\n").unwrap();

        let subscriber = FileSubscriber::with_poll_interval(Duration::from_millis(5));
        let mut subscription = subscriber.subscribe(&file_source(&path)).await.unwrap();

        fs::write(&path, "fresh\n").unwrap();
        let batch = subscription.receive().await.unwrap().unwrap();
        assert_eq!(batch[0].message, "fresh");
    }

    #[tokio::test]
    async fn subscribing_to_a_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = file_source(&dir.path().join("gone.log"));
        let err = FileSubscriber::default().subscribe(&source).await.err().unwrap();
        assert!(matches!(err, SubscriptionError::Open { .. }));
    }
}
