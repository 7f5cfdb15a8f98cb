//! Repository consistency check
//!
//! Every enumerated object is re-hashed and compared with the checksum its
//! name claims. Per-object failures are collected into the report and never
//! stop the scan; only a failure of the enumeration itself aborts it.

use crate::checksum::{checksum_literal_with, compute_checksum_with};
use crate::error::{ChecksumError, FsckError, ObjectError};
use crate::object::{ObjectType, RepoMode, ARCHIVE_SUFFIX};
use crate::repository::{ObjectEntry, Repository};
use std::path::PathBuf;
use tracing::{error, info};

/// Knobs for a consistency check run
#[derive(Default)]
pub struct FsckOptions<'a> {
    /// Polled between objects and between content chunks; returning true
    /// abandons the run
    pub interrupt: Option<&'a dyn Fn() -> bool>,
}

/// One object that failed verification
#[derive(Debug)]
pub struct ObjectFailure {
    pub checksum: String,
    pub objtype: ObjectType,
    pub path: PathBuf,
    pub error: ObjectError,
}

impl ObjectFailure {
    pub fn is_mismatch(&self) -> bool {
        matches!(self.error, ObjectError::Mismatch { .. })
    }
}

/// Outcome of a full scan
#[derive(Debug, Default)]
pub struct FsckReport {
    /// Objects examined, failed or not
    pub n_objects: u64,
    pub failures: Vec<ObjectFailure>,
}

impl FsckReport {
    /// Sticky error flag: set once any object failed
    pub fn had_error(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Objects whose recomputed checksum differs from the claimed one
    pub fn corrupted(&self) -> impl Iterator<Item = &ObjectFailure> {
        self.failures.iter().filter(|f| f.is_mismatch())
    }
}

/// Verify a single enumerated object
pub fn verify_object(
    mode: RepoMode,
    entry: &ObjectEntry,
    interrupt: &dyn Fn() -> bool,
) -> Result<(), ObjectError> {
    let actual = if mode.uses_archive_encoding(entry.objtype) {
        if !entry.path.to_string_lossy().ends_with(ARCHIVE_SUFFIX) {
            return Err(ObjectError::Naming(entry.path.clone()));
        }
        compute_checksum_with(entry.objtype, mode, &entry.path, interrupt)?
    } else {
        checksum_literal_with(&entry.path, entry.objtype, interrupt)?
    };

    let actual = actual.to_hex();
    if actual != entry.checksum {
        return Err(ObjectError::Mismatch {
            expected: entry.checksum.clone(),
            actual,
        });
    }
    Ok(())
}

/// Check every object in `repo`
pub fn check(repo: &Repository) -> Result<FsckReport, FsckError> {
    check_with(repo, &FsckOptions::default())
}

pub fn check_with(repo: &Repository, options: &FsckOptions<'_>) -> Result<FsckReport, FsckError> {
    let never = || false;
    let interrupt: &dyn Fn() -> bool = options.interrupt.unwrap_or(&never);
    let mode = repo.mode();
    let mut report = FsckReport::default();

    for item in repo.iter_objects() {
        if interrupt() {
            return Err(FsckError::Interrupted);
        }
        let entry = item.map_err(FsckError::Enumeration)?;

        match verify_object(mode, &entry, interrupt) {
            Ok(()) => {}
            Err(ObjectError::Checksum(ChecksumError::Interrupted)) => {
                return Err(FsckError::Interrupted);
            }
            Err(err) => {
                match &err {
                    ObjectError::Mismatch { expected, actual } => error!(
                        "corrupted {} object '{}': recomputed checksum {}",
                        entry.objtype, expected, actual
                    ),
                    other => error!("{}: {}", entry.path.display(), other),
                }
                report.failures.push(ObjectFailure {
                    checksum: entry.checksum,
                    objtype: entry.objtype,
                    path: entry.path,
                    error: err,
                });
            }
        }
        report.n_objects += 1;
    }

    info!(
        "Checked {} objects in {}: {} failures",
        report.n_objects,
        repo.root().display(),
        report.failures.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Entity;
    use crate::metadata::EntityMeta;
    use crate::object::Checksum;
    use tempfile::TempDir;

    fn failure(error: ObjectError) -> ObjectFailure {
        ObjectFailure {
            checksum: "00".repeat(32),
            objtype: ObjectType::File,
            path: PathBuf::from("objects/00/x.archive"),
            error,
        }
    }

    #[test]
    fn test_empty_report_is_clean() {
        let report = FsckReport::default();
        assert!(!report.had_error());
        assert_eq!(report.corrupted().count(), 0);
    }

    #[test]
    fn test_corrupted_filters_mismatches() {
        let report = FsckReport {
            n_objects: 2,
            failures: vec![
                failure(ObjectError::Naming(PathBuf::from("objects/00/x.file"))),
                failure(ObjectError::Mismatch {
                    expected: "a".into(),
                    actual: "b".into(),
                }),
            ],
        };
        assert!(report.had_error());
        assert_eq!(report.corrupted().count(), 1);
    }

    #[test]
    fn test_verify_object_detects_naming_error() {
        let tmp = TempDir::new().unwrap();
        let entry = ObjectEntry {
            checksum: "ab".repeat(32),
            objtype: ObjectType::File,
            path: tmp.path().join("objects/ab/whatever.file"),
        };
        let err = verify_object(RepoMode::Archive, &entry, &|| false).unwrap_err();
        assert!(matches!(err, ObjectError::Naming(_)));
    }

    #[test]
    fn test_verify_object_meta_in_archive_repo() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(tmp.path(), RepoMode::Archive).unwrap();
        let sum = repo.write_meta(ObjectType::DirMeta, b"dirmeta").unwrap();
        let entry = ObjectEntry {
            checksum: sum.to_hex(),
            objtype: ObjectType::DirMeta,
            path: repo.object_path(&sum, ObjectType::DirMeta),
        };
        verify_object(RepoMode::Archive, &entry, &|| false).unwrap();
    }

    #[test]
    fn test_check_interrupted() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(tmp.path(), RepoMode::Archive).unwrap();
        let entity = Entity::regular(EntityMeta::new(0, 0, 0o100644), &b"x"[..]);
        repo.write_content(entity).unwrap();

        let stop = || true;
        let options = FsckOptions {
            interrupt: Some(&stop),
        };
        assert!(matches!(check_with(&repo, &options), Err(FsckError::Interrupted)));
    }

    #[test]
    fn test_mismatch_reports_both_checksums() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(tmp.path(), RepoMode::Bare).unwrap();
        let sum = repo.write_meta(ObjectType::Commit, b"original").unwrap();
        std::fs::write(repo.object_path(&sum, ObjectType::Commit), b"tampered").unwrap();

        let report = check(&repo).unwrap();
        assert_eq!(report.n_objects, 1);
        match &report.failures[0].error {
            ObjectError::Mismatch { expected, actual } => {
                assert_eq!(expected, &sum.to_hex());
                assert_eq!(actual, &Checksum::of_bytes(b"tampered").to_hex());
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }
}
