use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive;
use crate::cancel::CancellationToken;
use crate::client::{ArchiveClient, ImageRequest, PackageRequest};
use crate::config::RetryPolicy;
use crate::domain::{Granularity, SeriesUid};
use crate::error::NbiaError;
use crate::manifest::ParsedManifest;
use crate::normalize::Field;
use crate::results::ResultSet;

const PACKAGE_FILE: &str = "package.zip";
const UNPACKED_DIR: &str = "series";
const STAGING_PREFIX: &str = ".nbia-staging-";
const IMAGE_SUFFIX: &str = ".dcm";

/// Where a series package ends up under the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageLayout {
    /// `destination/<uid>/<files>`
    #[default]
    Extract,
    /// `destination/<uid>.zip`
    KeepArchive,
}

/// What to do when a series is already present in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingPolicy {
    #[default]
    Overwrite,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub concurrency: usize,
    /// Retries after the first attempt of a task.
    pub max_retries: u32,
    pub retry_delay: RetryPolicy,
    pub verify_md5: bool,
    pub layout: PackageLayout,
    pub existing: ExistingPolicy,
    /// Dispatch at most this many tasks; the rest are skipped.
    pub limit: Option<usize>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 2,
            retry_delay: RetryPolicy::default(),
            verify_md5: false,
            layout: PackageLayout::default(),
            existing: ExistingPolicy::default(),
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Network,
    Integrity,
    Extraction,
}

impl FailureKind {
    pub fn of(err: &NbiaError) -> Self {
        match err {
            NbiaError::Integrity(_) => FailureKind::Integrity,
            NbiaError::Extraction(_) | NbiaError::Filesystem(_) => FailureKind::Extraction,
            _ => FailureKind::Network,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Network => write!(f, "network"),
            FailureKind::Integrity => write!(f, "integrity"),
            FailureKind::Extraction => write!(f, "extraction"),
        }
    }
}

/// Which identifier of a result set names the package to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectSource {
    /// The record key; only series-level results are keyed by series UID.
    #[default]
    NaturalKey,
    Field(Field),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadTask {
    pub uid: SeriesUid,
    pub base_url: Option<String>,
    /// Set by the orchestrator when the batch starts.
    pub target: Option<Utf8PathBuf>,
    pub status: TaskStatus,
    pub retries: u32,
}

impl DownloadTask {
    pub fn new(uid: SeriesUid) -> Self {
        Self {
            uid,
            base_url: None,
            target: None,
            status: TaskStatus::Pending,
            retries: 0,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn from_manifest(manifest: &ParsedManifest) -> Vec<Self> {
        manifest
            .entries
            .iter()
            .map(|entry| Self {
                base_url: entry.base_url.clone(),
                ..Self::new(entry.uid.clone())
            })
            .collect()
    }

    pub fn from_result_set(results: &ResultSet, source: ObjectSource) -> Result<Vec<Self>, NbiaError> {
        match source {
            ObjectSource::NaturalKey => {
                if results.granularity() != Granularity::Series {
                    return Err(NbiaError::GranularityMismatch {
                        granularity: results.granularity().to_string(),
                        field: Field::SeriesInstanceUid.to_string(),
                    });
                }
                results
                    .keys()
                    .map(|key| key.parse().map(Self::new))
                    .collect()
            }
            ObjectSource::Field(field) => {
                let mut seen = HashSet::new();
                let mut tasks = Vec::new();
                for record in results.records() {
                    let Some(value) = record.text(field) else {
                        debug!(record = record.key(), %field, "record carries no object identifier");
                        continue;
                    };
                    let uid: SeriesUid = value.parse()?;
                    if seen.insert(uid.clone()) {
                        tasks.push(Self::new(uid));
                    }
                }
                if tasks.is_empty() && !results.is_empty() {
                    return Err(NbiaError::GranularityMismatch {
                        granularity: results.granularity().to_string(),
                        field: field.to_string(),
                    });
                }
                Ok(tasks)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub uid: SeriesUid,
    pub status: TaskStatus,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

/// Discards progress events.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub uid: SeriesUid,
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Duplicate,
    AlreadyDownloaded,
    BeyondLimit,
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Duplicate => write!(f, "duplicate of an earlier task"),
            SkipReason::AlreadyDownloaded => write!(f, "already downloaded"),
            SkipReason::BeyondLimit => write!(f, "beyond the task limit"),
            SkipReason::Cancelled => write!(f, "cancelled before dispatch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTask {
    pub uid: SeriesUid,
    pub reason: SkipReason,
}

/// Where a single image landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageDownload {
    pub path: Utf8PathBuf,
    /// `false` when an existing file was kept.
    pub fetched: bool,
    pub attempts: u32,
}

/// Outcome of one batch, in input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<SeriesUid>,
    pub failed: Vec<FailedTask>,
    pub skipped: Vec<SkippedTask>,
    pub cancelled: bool,
    pub tasks: Vec<DownloadTask>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    pub fn failed_uids(&self) -> impl Iterator<Item = &SeriesUid> {
        self.failed.iter().map(|task| &task.uid)
    }

    pub fn skipped_uids(&self) -> impl Iterator<Item = &SeriesUid> {
        self.skipped.iter().map(|task| &task.uid)
    }

    /// Series present in the destination after the batch: fetched now or
    /// kept from an earlier run. Input order.
    pub fn downloaded_uids(&self) -> Vec<&SeriesUid> {
        self.tasks
            .iter()
            .filter(|task| {
                task.status == TaskStatus::Succeeded
                    || self.skipped.iter().any(|skipped| {
                        skipped.uid == task.uid && skipped.reason == SkipReason::AlreadyDownloaded
                    })
            })
            .map(|task| &task.uid)
            .collect()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len()
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        for task in &self.failed {
            write!(
                f,
                "\n  failed {} [{}] after {} attempt(s): {}",
                task.uid, task.kind, task.attempts, task.reason
            )?;
        }
        Ok(())
    }
}

enum Outcome {
    Succeeded,
    Failed { kind: FailureKind, reason: String },
    Skipped(SkipReason),
}

struct Slot {
    task: DownloadTask,
    outcome: Option<Outcome>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fetches series packages into a destination directory with a bounded
/// pool of workers.
pub struct Downloader<'a, C: ArchiveClient + ?Sized> {
    client: &'a C,
    options: DownloadOptions,
}

impl<'a, C: ArchiveClient + ?Sized> Downloader<'a, C> {
    pub fn new(client: &'a C, options: DownloadOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    pub fn target_for(&self, destination: &Utf8Path, uid: &SeriesUid) -> Utf8PathBuf {
        match self.options.layout {
            PackageLayout::Extract => destination.join(uid.as_str()),
            PackageLayout::KeepArchive => destination.join(format!("{uid}.zip")),
        }
    }

    /// Whether a series is already in `destination`, in either layout.
    pub fn is_present(destination: &Utf8Path, uid: &SeriesUid) -> bool {
        destination.join(uid.as_str()).exists() || destination.join(format!("{uid}.zip")).exists()
    }

    /// Runs every task to a terminal state. Per-task failures land in the
    /// report; only a destination that cannot be created is an error.
    pub fn run(
        &self,
        tasks: Vec<DownloadTask>,
        destination: &Utf8Path,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<BatchReport, NbiaError> {
        let started = Instant::now();
        fs::create_dir_all(destination)
            .map_err(|err| NbiaError::Filesystem(format!("create {destination}: {err}")))?;

        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        let mut slots = Vec::with_capacity(tasks.len());
        for (index, mut task) in tasks.into_iter().enumerate() {
            let target = self.target_for(destination, &task.uid);
            let skip = if !seen.insert(task.uid.clone()) {
                Some(SkipReason::Duplicate)
            } else if self.options.existing == ExistingPolicy::Skip
                && Self::is_present(destination, &task.uid)
            {
                Some(SkipReason::AlreadyDownloaded)
            } else if self.options.limit.is_some_and(|limit| queue.len() >= limit) {
                Some(SkipReason::BeyondLimit)
            } else {
                None
            };

            task.target = Some(target);
            task.status = match skip {
                Some(_) => TaskStatus::Skipped,
                None => {
                    queue.push_back(index);
                    TaskStatus::Pending
                }
            };
            slots.push(Mutex::new(Slot {
                task,
                outcome: skip.map(Outcome::Skipped),
            }));
        }

        let dispatched = queue.len();
        let workers = self.options.concurrency.max(1).min(dispatched);
        info!(tasks = slots.len(), dispatched, workers, %destination, "starting download batch");

        let queue = Mutex::new(queue);
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.work(&queue, &slots, destination, cancel, sink));
            }
        });

        let mut report = BatchReport {
            cancelled: cancel.is_cancelled(),
            ..BatchReport::default()
        };
        for slot in slots {
            let Slot { mut task, outcome } = slot.into_inner().unwrap_or_else(PoisonError::into_inner);
            match outcome {
                Some(Outcome::Succeeded) => report.succeeded.push(task.uid.clone()),
                Some(Outcome::Failed { kind, reason }) => report.failed.push(FailedTask {
                    uid: task.uid.clone(),
                    kind,
                    reason,
                    attempts: task.retries + 1,
                }),
                Some(Outcome::Skipped(reason)) => report.skipped.push(SkippedTask {
                    uid: task.uid.clone(),
                    reason,
                }),
                None => {
                    task.status = TaskStatus::Skipped;
                    report.skipped.push(SkippedTask {
                        uid: task.uid.clone(),
                        reason: SkipReason::Cancelled,
                    });
                }
            }
            report.tasks.push(task);
        }
        report.elapsed = started.elapsed();

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "download batch finished"
        );
        Ok(report)
    }

    fn work(
        &self,
        queue: &Mutex<VecDeque<usize>>,
        slots: &[Mutex<Slot>],
        destination: &Utf8Path,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let Some(index) = lock(queue).pop_front() else {
                break;
            };
            let mut task = lock(&slots[index]).task.clone();
            let outcome = self.run_task(&mut task, destination, cancel, sink);
            let mut slot = lock(&slots[index]);
            slot.task = task;
            slot.outcome = Some(outcome);
        }
    }

    fn run_task(
        &self,
        task: &mut DownloadTask,
        destination: &Utf8Path,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Outcome {
        let target = self.target_for(destination, &task.uid);
        loop {
            task.status = TaskStatus::InProgress;
            sink.event(ProgressEvent {
                uid: task.uid.clone(),
                status: TaskStatus::InProgress,
                message: format!("attempt {}", task.retries + 1),
                elapsed: None,
            });

            let started = Instant::now();
            match self.fetch_into(task, &target, destination) {
                Ok(files) => {
                    task.status = TaskStatus::Succeeded;
                    info!(series = %task.uid, files, %target, "series downloaded");
                    sink.event(ProgressEvent {
                        uid: task.uid.clone(),
                        status: TaskStatus::Succeeded,
                        message: format!("{files} file(s)"),
                        elapsed: Some(started.elapsed()),
                    });
                    return Outcome::Succeeded;
                }
                Err(err) => {
                    let kind = FailureKind::of(&err);
                    if self.should_retry(&err, task.retries, cancel) {
                        let delay = self.options.retry_delay.delay_for(task.retries);
                        warn!(series = %task.uid, %kind, %err, retry = task.retries + 1, ?delay, "retrying series");
                        if cancel.wait(delay) {
                            task.retries += 1;
                            task.status = TaskStatus::Pending;
                            continue;
                        }
                    }
                    task.status = TaskStatus::Failed;
                    warn!(series = %task.uid, %kind, %err, attempts = task.retries + 1, "series failed");
                    sink.event(ProgressEvent {
                        uid: task.uid.clone(),
                        status: TaskStatus::Failed,
                        message: err.to_string(),
                        elapsed: Some(started.elapsed()),
                    });
                    return Outcome::Failed {
                        kind,
                        reason: err.to_string(),
                    };
                }
            }
        }
    }

    /// Rejected requests are final; anything else is retried while retries
    /// remain and the batch is not cancelled.
    fn should_retry(&self, err: &NbiaError, retries: u32, cancel: &CancellationToken) -> bool {
        !matches!(err, NbiaError::RequestRejected { .. })
            && retries < self.options.max_retries
            && !cancel.is_cancelled()
    }

    /// Fetches one DICOM instance to `destination/<series>/<sop>.dcm`,
    /// staged and verified like a package, with the same retry policy.
    pub fn download_image(
        &self,
        request: &ImageRequest,
        destination: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<ImageDownload, NbiaError> {
        let dir = destination.join(request.series.as_str());
        let target = dir.join(format!("{}{IMAGE_SUFFIX}", request.sop));
        if self.options.existing == ExistingPolicy::Skip && target.exists() {
            info!(series = %request.series, sop = %request.sop, %target, "image already downloaded");
            return Ok(ImageDownload {
                path: target,
                fetched: false,
                attempts: 0,
            });
        }
        fs::create_dir_all(&dir)
            .map_err(|err| NbiaError::Filesystem(format!("create {dir}: {err}")))?;

        let mut retries = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(NbiaError::Cancelled);
            }
            match self.fetch_image_into(request, &dir, &target) {
                Ok(bytes) => {
                    info!(series = %request.series, sop = %request.sop, bytes, %target, "image downloaded");
                    return Ok(ImageDownload {
                        path: target,
                        fetched: true,
                        attempts: retries + 1,
                    });
                }
                Err(err) => {
                    if !self.should_retry(&err, retries, cancel) {
                        warn!(sop = %request.sop, %err, attempts = retries + 1, "image failed");
                        return Err(err);
                    }
                    let delay = self.options.retry_delay.delay_for(retries);
                    warn!(sop = %request.sop, %err, retry = retries + 1, ?delay, "retrying image");
                    if !cancel.wait(delay) {
                        return Err(err);
                    }
                    retries += 1;
                }
            }
        }
    }

    fn fetch_image_into(
        &self,
        request: &ImageRequest,
        dir: &Utf8Path,
        target: &Utf8Path,
    ) -> Result<u64, NbiaError> {
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(IMAGE_SUFFIX)
            .tempfile_in(dir)
            .map_err(|err| NbiaError::Filesystem(format!("create staging in {dir}: {err}")))?;
        let info = self.client.fetch_image(request, staging.path())?;
        debug!(sop = %request.sop, bytes = info.bytes, "image fetched");

        let bytes = archive::verify_dicom(staging.path())?;
        staging
            .persist(target)
            .map_err(|err| NbiaError::Filesystem(format!("move into {target}: {}", err.error)))?;
        Ok(bytes)
    }

    /// One attempt: fetch into staging, verify, unpack, then swap into place.
    /// Staging is removed when this returns, whatever the result.
    fn fetch_into(
        &self,
        task: &DownloadTask,
        target: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<usize, NbiaError> {
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(destination)
            .map_err(|err| NbiaError::Filesystem(format!("create staging in {destination}: {err}")))?;
        let package = staging.path().join(PACKAGE_FILE);

        let request = PackageRequest {
            uid: task.uid.clone(),
            with_md5: self.options.verify_md5,
            base_url: task.base_url.clone(),
        };
        let info = self.client.fetch_package(&request, &package)?;
        debug!(series = %task.uid, bytes = info.bytes, is_zip = info.is_zip, "package fetched");

        let summary = archive::verify_package(&package, self.options.verify_md5)?;
        match self.options.layout {
            PackageLayout::Extract => {
                let unpacked = staging.path().join(UNPACKED_DIR);
                fs::create_dir(&unpacked).map_err(|err| NbiaError::Extraction(err.to_string()))?;
                archive::extract_zip(&package, &unpacked)?;
                replace(&unpacked, target.as_std_path())?;
            }
            PackageLayout::KeepArchive => replace(&package, target.as_std_path())?,
        }
        Ok(summary.files)
    }
}

/// Removes whatever is at `target`, then renames `source` onto it.
fn replace(source: &Path, target: &Path) -> Result<(), NbiaError> {
    let removed = match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target),
        Ok(_) => fs::remove_file(target),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    };
    removed.map_err(|err| {
        NbiaError::Filesystem(format!("remove previous {}: {err}", target.display()))
    })?;
    fs::rename(source, target)
        .map_err(|err| NbiaError::Filesystem(format!("move into {}: {err}", target.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_categories() {
        assert_eq!(
            FailureKind::of(&NbiaError::Integrity("crc".to_string())),
            FailureKind::Integrity
        );
        assert_eq!(
            FailureKind::of(&NbiaError::Filesystem("full".to_string())),
            FailureKind::Extraction
        );
        assert_eq!(
            FailureKind::of(&NbiaError::RequestRejected {
                status: 404,
                message: String::new()
            }),
            FailureKind::Network
        );
    }

    #[test]
    fn replace_overwrites_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("new");
        let target = dir.path().join("old");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("b.dcm"), b"new").unwrap();
        fs::create_dir(&target).unwrap();
        fs::write(target.join("a.dcm"), b"old").unwrap();

        replace(&source, &target).unwrap();
        assert!(!source.exists());
        assert!(target.join("b.dcm").exists());
        assert!(!target.join("a.dcm").exists());
    }

    #[test]
    fn skip_reasons_read_as_before() {
        assert_eq!(SkipReason::Duplicate.to_string(), "duplicate of an earlier task");
        assert_eq!(SkipReason::Cancelled.to_string(), "cancelled before dispatch");
        assert_eq!(
            serde_json::to_value(SkipReason::AlreadyDownloaded).unwrap(),
            serde_json::json!("already_downloaded")
        );
    }

    #[test]
    fn report_summary() {
        let report = BatchReport {
            succeeded: vec!["1.2.3".parse().unwrap()],
            failed: vec![FailedTask {
                uid: "1.2.4".parse().unwrap(),
                kind: FailureKind::Network,
                reason: "timeout".to_string(),
                attempts: 3,
            }],
            ..BatchReport::default()
        };
        assert_eq!(
            report.to_string(),
            "1 succeeded, 1 failed, 0 skipped\n  failed 1.2.4 [network] after 3 attempt(s): timeout"
        );
    }
}
