//! Offline pass that bakes EXIF orientation into photos stored before
//! uploads were corrected on ingest.
//!
//! Files already at identity orientation are left alone, so running the
//! pass again over the same tree only reports skips.

use crate::encode::{self, StoredSource};
use crate::error::OptimizeError;
use crate::media::ImageKind;
use glob::glob;
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Processed,
    Skipped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub file: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessSummary {
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub files: Vec<FileOutcome>,
}

impl ReprocessSummary {
    pub fn record(&mut self, outcome: FileOutcome) {
        match outcome.status {
            Status::Processed => self.processed += 1,
            Status::Skipped => self.skipped += 1,
            Status::Error => self.errors += 1,
        }
        self.files.push(outcome);
    }

    /// Combine two partial summaries; `other`'s files go after ours.
    pub fn merge(mut self, other: Self) -> Self {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.files.extend(other.files);
        self
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files.iter().filter(|f| f.status == Status::Error)
    }
}

impl FromIterator<FileOutcome> for ReprocessSummary {
    fn from_iter<I: IntoIterator<Item = FileOutcome>>(iter: I) -> Self {
        let mut summary = Self::default();
        for outcome in iter {
            summary.record(outcome);
        }
        summary
    }
}

pub struct Reprocessor {
    photos_dir: PathBuf,
    jpeg_quality: u8,
}

impl Reprocessor {
    pub fn new(photos_dir: &Path, jpeg_quality: u8) -> Self {
        Self {
            photos_dir: photos_dir.to_path_buf(),
            jpeg_quality,
        }
    }

    /// Supported image files exactly three levels down: year, month, file.
    pub fn candidates(&self) -> impl Iterator<Item = PathBuf> + use<> {
        let root = glob::Pattern::escape(&self.photos_dir.to_string_lossy());
        let pattern = format!("{root}/*/*/*");
        let paths = match glob(&pattern) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "invalid reprocess glob");
                None
            }
        };
        paths
            .into_iter()
            .flatten()
            .filter_map(|entry| match entry {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable entry in photo tree");
                    None
                }
            })
            .filter(|p| p.is_file() && ImageKind::from_path(p).is_some())
    }

    /// Lazily process every candidate. A failing file yields an `Error`
    /// outcome and the walk moves on.
    pub fn outcomes(&self) -> impl Iterator<Item = FileOutcome> + '_ {
        self.candidates().map(|p| self.process(&p))
    }

    pub fn run(&self) -> ReprocessSummary {
        let summary: ReprocessSummary = self.outcomes().collect();
        self.log_summary(&summary);
        summary
    }

    /// Same as [`run`](Self::run) on `jobs` worker threads. Each worker
    /// accumulates its own partial summary; partials are merged in file order.
    pub fn run_parallel(&self, jobs: usize) -> anyhow::Result<ReprocessSummary> {
        let files: Vec<PathBuf> = self.candidates().collect();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs.max(1))
            .build()?;
        let summary = pool.install(|| {
            files
                .par_iter()
                .map(|p| self.process(p))
                .fold(ReprocessSummary::default, |mut acc, outcome| {
                    acc.record(outcome);
                    acc
                })
                .reduce(ReprocessSummary::default, ReprocessSummary::merge)
        });
        self.log_summary(&summary);
        Ok(summary)
    }

    fn process(&self, path: &Path) -> FileOutcome {
        let file = path.display().to_string();
        match reprocess_file(path, self.jpeg_quality) {
            Ok(status) => {
                if status == Status::Processed {
                    tracing::info!(file = %file, "fixed orientation");
                }
                FileOutcome {
                    file,
                    status,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(file = %file, error = %e, "reprocessing failed");
                FileOutcome {
                    file,
                    status: Status::Error,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn log_summary(&self, summary: &ReprocessSummary) {
        tracing::info!(
            root = %self.photos_dir.display(),
            processed = summary.processed,
            skipped = summary.skipped,
            errors = summary.errors,
            "reprocess pass finished"
        );
    }
}

/// Correct one stored file. Identity-oriented files are not rewritten.
pub fn reprocess_file(path: &Path, jpeg_quality: u8) -> Result<Status, OptimizeError> {
    let source = StoredSource::read(path)?;
    if source.orientation.is_identity() {
        return Ok(Status::Skipped);
    }
    let img = encode::prepare(source.decode()?, source.orientation, None);
    encode::rewrite(&source.path, source.kind, &img, jpeg_quality)?;
    Ok(Status::Processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::DEFAULT_JPEG_QUALITY;
    use crate::orientation::tests::{app1_end, asymmetric, jpeg_with_orientation};
    use crate::orientation::{Orientation, read_orientation};
    use image::GenericImageView;

    fn put(root: &Path, rel: &str, bytes: &[u8]) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn reprocessor(root: &Path) -> Reprocessor {
        Reprocessor::new(&root.join("photos"), DEFAULT_JPEG_QUALITY)
    }

    #[test]
    fn second_pass_only_skips() {
        let root = tempfile::tempdir().unwrap();
        let rotated = jpeg_with_orientation(&asymmetric(), Orientation::Rotate90Cw);
        let path = put(root.path(), "photos/2023/05/a.jpg", &rotated);

        let first = reprocessor(root.path()).run();
        assert_eq!((first.processed, first.skipped, first.errors), (1, 0, 0));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(read_orientation(&bytes), Orientation::Identity);
        assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (2, 3));

        let second = reprocessor(root.path()).run();
        assert_eq!((second.processed, second.skipped, second.errors), (0, 1, 0));
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn errors_do_not_stop_the_walk() {
        let root = tempfile::tempdir().unwrap();
        let rotated = jpeg_with_orientation(&asymmetric(), Orientation::Rotate180);
        // Headers up to and including the EXIF segment, and nothing after it.
        let mut broken = jpeg_with_orientation(&asymmetric(), Orientation::Rotate90Ccw);
        let end = app1_end(&broken).unwrap();
        broken.truncate(end);
        put(root.path(), "photos/2022/01/a.jpg", &broken);
        put(root.path(), "photos/2022/01/b.jpg", &rotated);
        // No readable metadata at all: identity, so skipped.
        put(root.path(), "photos/2022/02/c.png", b"not a png");

        let summary = reprocessor(root.path()).run();
        assert_eq!(summary.files.len(), 3);
        assert_eq!((summary.processed, summary.skipped, summary.errors), (1, 1, 1));
        let failed: Vec<&FileOutcome> = summary.failures().collect();
        assert!(failed[0].file.ends_with("a.jpg"));
        assert!(failed[0].error.is_some());
        assert_eq!(std::fs::read(root.path().join("photos/2022/01/a.jpg")).unwrap(), broken);
    }

    #[test]
    fn walk_is_depth_bounded_and_filtered() {
        let root = tempfile::tempdir().unwrap();
        let jpeg = jpeg_with_orientation(&asymmetric(), Orientation::Identity);
        put(root.path(), "photos/2023/05/keep.jpeg", &jpeg);
        put(root.path(), "photos/2023/05/notes.txt", b"hello");
        put(root.path(), "photos/2023/loose.jpg", &jpeg);
        put(root.path(), "photos/2023/05/deeper/nested.jpg", &jpeg);

        let found: Vec<PathBuf> = reprocessor(root.path()).candidates().collect();
        assert_eq!(found, vec![root.path().join("photos/2023/05/keep.jpeg")]);
    }

    #[test]
    fn parallel_pass_matches_sequential_counts() {
        let root = tempfile::tempdir().unwrap();
        for (i, o) in Orientation::ALL.iter().enumerate() {
            let bytes = jpeg_with_orientation(&asymmetric(), *o);
            put(root.path(), &format!("photos/2024/{:02}/{i}.jpg", i % 3 + 1), &bytes);
        }
        let summary = reprocessor(root.path()).run_parallel(4).unwrap();
        assert_eq!(summary.processed, 7);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 0);
        let mut sorted = summary.files.clone();
        sorted.sort_by(|a, b| a.file.cmp(&b.file));
        assert_eq!(sorted, summary.files);

        let again = reprocessor(root.path()).run_parallel(4).unwrap();
        assert_eq!((again.processed, again.skipped), (0, 8));
    }

    #[test]
    fn summary_serializes_like_the_cli_contract() {
        let summary: ReprocessSummary = vec![
            FileOutcome {
                file: "a.jpg".into(),
                status: Status::Processed,
                error: None,
            },
            FileOutcome {
                file: "b.jpg".into(),
                status: Status::Error,
                error: Some("boom".into()),
            },
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["processed"], 1);
        assert_eq!(json["errors"], 1);
        assert_eq!(json["files"][0]["status"], "processed");
        assert!(json["files"][0].get("error").is_none());
        assert_eq!(json["files"][1]["error"], "boom");
    }
}
