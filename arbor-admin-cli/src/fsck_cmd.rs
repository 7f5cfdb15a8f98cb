//! Repository consistency check command

use anyhow::{anyhow, Context, Result};
use arbor_core::{check, FsckReport, ObjectError, Repository};
use std::io::Write;
use std::path::Path;

/// Run fsck over the repository at `repo_path`.
///
/// Diagnostics and the object total both go to `err`; stdout stays empty.
pub fn fsck_repository(repo_path: &Path, quiet: bool, err: &mut dyn Write) -> Result<()> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("Failed to open repository {}", repo_path.display()))?;
    let report = check(&repo).context("Failed to enumerate repository objects")?;

    write_diagnostics(&report, err)?;

    if report.had_error() {
        return Err(anyhow!("Encountered filesystem consistency errors"));
    }
    if !quiet {
        writeln!(err, "Total Objects: {}", report.n_objects)?;
    }
    Ok(())
}

fn write_diagnostics(report: &FsckReport, err: &mut dyn Write) -> Result<()> {
    for failure in &report.failures {
        match &failure.error {
            ObjectError::Mismatch { expected, actual } => writeln!(
                err,
                "ERROR: corrupted object {}.{}: recomputed checksum {}",
                expected, failure.objtype, actual
            )?,
            other => writeln!(err, "ERROR: {}: {}", failure.path.display(), other)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{ObjectType, RepoMode};
    use tempfile::TempDir;

    fn run(repo: &Path, quiet: bool) -> (Result<()>, String) {
        let mut err = Vec::new();
        let result = fsck_repository(repo, quiet, &mut err);
        (result, String::from_utf8(err).unwrap())
    }

    #[test]
    fn test_clean_repository_prints_total() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(tmp.path(), RepoMode::Archive).unwrap();
        repo.write_meta(ObjectType::Commit, b"a").unwrap();
        repo.write_meta(ObjectType::DirTree, b"b").unwrap();

        let (result, err) = run(tmp.path(), false);
        result.unwrap();
        assert_eq!(err, "Total Objects: 2\n");

        let (result, err) = run(tmp.path(), true);
        result.unwrap();
        assert!(err.is_empty());
    }

    #[test]
    fn test_corruption_fails_with_diagnostic() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(tmp.path(), RepoMode::Bare).unwrap();
        let sum = repo.write_meta(ObjectType::DirMeta, b"meta").unwrap();
        std::fs::write(repo.object_path(&sum, ObjectType::DirMeta), b"atem").unwrap();
        let actual = arbor_core::Checksum::of_bytes(b"atem");

        let (result, err) = run(tmp.path(), false);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Encountered filesystem consistency errors"
        );
        assert_eq!(
            err,
            format!(
                "ERROR: corrupted object {}.dirmeta: recomputed checksum {}\n",
                sum, actual
            )
        );
    }

    #[test]
    fn test_not_a_repository() {
        let tmp = TempDir::new().unwrap();
        let (result, _) = run(tmp.path(), false);
        assert!(result.is_err());
    }
}
