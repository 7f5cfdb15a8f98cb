//! On-disk object repository
//!
//! Layout:
//! ```text
//! {root}/
//!   config                                # TOML, `[core] repo_version, mode`
//!   objects/{hex[0..2]}/{hex[2..]}.{ext}  # loose objects
//!   tmp/                                  # staging area for atomic writes
//! ```
//!
//! Meta objects use the `commit`, `dirtree` and `dirmeta` extensions.
//! Content objects are `.file` literal nodes in bare repositories and
//! `.archive` encoded files in archive repositories.

use crate::archive::write_archived;
use crate::checksum::{checksum_literal, compute_checksum, Entity};
use crate::error::{ChecksumError, RepoError};
use crate::metadata::{write_xattrs, EntityKind, Xattrs};
use crate::object::{Checksum, ObjectType, RepoMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

pub const REPO_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RepoConfig {
    core: CoreConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct CoreConfig {
    repo_version: u32,
    mode: RepoMode,
}

/// One loose object found by enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Checksum claimed by the object's location in the store
    pub checksum: String,
    pub objtype: ObjectType,
    pub path: PathBuf,
}

/// A content-addressed object repository
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    mode: RepoMode,
}

impl Repository {
    /// Create a new, empty repository at `path`
    pub fn create(path: &Path, mode: RepoMode) -> Result<Self> {
        let config_path = path.join("config");
        if config_path.exists() {
            return Err(RepoError::AlreadyExists(path.to_path_buf()));
        }

        fs::create_dir_all(path.join("objects"))?;
        fs::create_dir_all(path.join("tmp"))?;

        let config = RepoConfig {
            core: CoreConfig {
                repo_version: REPO_VERSION,
                mode,
            },
        };
        let text = toml::to_string(&config).map_err(|e| RepoError::Config(e.to_string()))?;
        fs::write(&config_path, text)?;

        info!("Created {} repository at {}", mode, path.display());
        Ok(Self {
            root: path.to_path_buf(),
            mode,
        })
    }

    /// Open an existing repository, validating its layout and config
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join("config");
        if !path.join("objects").is_dir() || !config_path.is_file() {
            return Err(RepoError::NotARepository(path.to_path_buf()));
        }

        let text = fs::read_to_string(&config_path)?;
        let config: RepoConfig =
            toml::from_str(&text).map_err(|e| RepoError::Config(e.to_string()))?;
        if config.core.repo_version != REPO_VERSION {
            return Err(RepoError::Config(format!(
                "unsupported repo_version {}",
                config.core.repo_version
            )));
        }

        fs::create_dir_all(path.join("tmp"))?;
        debug!("Opened {} repository at {}", config.core.mode, path.display());
        Ok(Self {
            root: path.to_path_buf(),
            mode: config.core.mode,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> RepoMode {
        self.mode
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Loose object path for `(checksum, objtype)` under this repository's mode
    pub fn object_path(&self, checksum: &Checksum, objtype: ObjectType) -> PathBuf {
        let hex = checksum.to_hex();
        self.objects_dir()
            .join(&hex[..2])
            .join(format!("{}{}", &hex[2..], self.mode.object_suffix(objtype)))
    }

    pub fn has_object(&self, checksum: &Checksum, objtype: ObjectType) -> bool {
        fs::symlink_metadata(self.object_path(checksum, objtype)).is_ok()
    }

    /// Store a meta object verbatim
    pub fn write_meta(&self, objtype: ObjectType, data: &[u8]) -> Result<Checksum> {
        if !objtype.is_meta() {
            return Err(RepoError::InvalidObject(format!(
                "{} is not a meta object type",
                objtype
            )));
        }
        let checksum = Checksum::of_bytes(data);
        if self.has_object(&checksum, objtype) {
            return Ok(checksum);
        }

        let mut tmp = NamedTempFile::new_in(self.tmp_dir())?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        self.install(tmp, &checksum, objtype)?;
        Ok(checksum)
    }

    /// Store a content entity and return its checksum.
    ///
    /// The checksum is derived from what actually landed on disk, so fsck
    /// always agrees with the writer.
    pub fn write_content(&self, entity: Entity) -> Result<Checksum> {
        match self.mode {
            RepoMode::Archive => self.write_archived_content(entity),
            RepoMode::Bare => self.write_bare_content(entity),
        }
    }

    /// Stage a filesystem node (not following symlinks) as a content object
    pub fn stage_path(&self, path: &Path) -> Result<Checksum> {
        let entity = Entity::from_path(path)?;
        self.write_content(entity)
    }

    fn write_archived_content(&self, entity: Entity) -> Result<Checksum> {
        let mut tmp = NamedTempFile::new_in(self.tmp_dir())?;
        {
            let writer = BufWriter::new(tmp.as_file_mut());
            let mut writer = write_archived(writer, entity)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;

        let checksum = compute_checksum(ObjectType::File, RepoMode::Archive, tmp.path())?;
        self.install(tmp, &checksum, ObjectType::File)?;
        Ok(checksum)
    }

    fn write_bare_content(&self, entity: Entity) -> Result<Checksum> {
        let meta = *entity.meta();
        let xattrs = entity.xattr_blob().map(Xattrs::from_bytes).transpose()?;

        let tmp = match meta.kind() {
            EntityKind::Regular => {
                let (_, _, _, content) = entity.into_parts();
                let mut content = content.ok_or_else(|| {
                    ChecksumError::Decode("regular file entity has no content stream".into())
                })?;
                let mut tmp = NamedTempFile::new_in(self.tmp_dir())?;
                {
                    let mut writer = BufWriter::new(tmp.as_file_mut());
                    io::copy(&mut content, &mut writer)?;
                    writer.flush()?;
                }
                tmp.as_file().sync_all()?;
                tmp.into_temp_path()
            }
            EntityKind::Symlink => {
                let target = std::ffi::OsStr::from_bytes(entity.symlink_target());
                tempfile::Builder::new()
                    .make_in(self.tmp_dir(), |p| std::os::unix::fs::symlink(target, p))?
                    .into_temp_path()
            }
            EntityKind::BlockDevice | EntityKind::CharDevice => tempfile::Builder::new()
                .make_in(self.tmp_dir(), |p| make_device(p, meta.mode, meta.rdev))?
                .into_temp_path(),
            EntityKind::Other => {
                return Err(RepoError::InvalidObject(format!(
                    "cannot store entity with mode {:o} as a content object",
                    meta.mode
                )));
            }
        };

        if let Err(e) = std::os::unix::fs::lchown(&tmp, Some(meta.uid), Some(meta.gid)) {
            // Unprivileged writers keep their own ownership; the checksum
            // below reflects whatever was actually stored.
            debug!("lchown {}:{} failed: {}", meta.uid, meta.gid, e);
        }
        if meta.kind() != EntityKind::Symlink {
            fs::set_permissions(&tmp, fs::Permissions::from_mode(meta.mode & 0o7777))?;
        }
        if let Some(xattrs) = &xattrs {
            write_xattrs(&tmp, xattrs)?;
        }

        let checksum = checksum_literal(&tmp, ObjectType::File)?;
        let dest = self.object_path(&checksum, ObjectType::File);
        if fs::symlink_metadata(&dest).is_ok() {
            return Ok(checksum);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        tmp.persist(&dest).map_err(|e| RepoError::Io(e.error))?;
        debug!("Stored content object {}", checksum);
        Ok(checksum)
    }

    fn install(&self, tmp: NamedTempFile, checksum: &Checksum, objtype: ObjectType) -> Result<()> {
        let dest = self.object_path(checksum, objtype);
        if fs::symlink_metadata(&dest).is_ok() {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        tmp.persist(&dest).map_err(|e| RepoError::Io(e.error))?;
        debug!("Stored {} object {}", objtype, checksum);
        Ok(())
    }

    /// Enumerate every loose object.
    ///
    /// The sequence is lazy, finite and can be restarted by calling this
    /// again. Its order is unspecified.
    pub fn iter_objects(&self) -> ObjectIter {
        ObjectIter {
            inner: walkdir::WalkDir::new(self.objects_dir())
                .min_depth(2)
                .max_depth(2)
                .into_iter(),
        }
    }
}

fn make_device(path: &Path, mode: u32, rdev: u32) -> io::Result<()> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;
    let rc = unsafe { libc::mknod(cpath.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Lazy iterator over loose objects
pub struct ObjectIter {
    inner: walkdir::IntoIter,
}

impl Iterator for ObjectIter {
    type Item = Result<ObjectEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(RepoError::Enumeration(e))),
            };
            if entry.file_type().is_dir() {
                continue;
            }
            match parse_object_name(entry.path()) {
                Some((checksum, objtype)) => {
                    return Some(Ok(ObjectEntry {
                        checksum,
                        objtype,
                        path: entry.into_path(),
                    }));
                }
                None => warn!("Skipping unrecognized file {}", entry.path().display()),
            }
        }
    }
}

/// Split `objects/ab/cdef….ext` into its claimed checksum and type
fn parse_object_name(path: &Path) -> Option<(String, ObjectType)> {
    let prefix = path.parent()?.file_name()?.to_str()?;
    let name = path.file_name()?.to_str()?;
    let (stem, ext) = name.split_once('.')?;
    let objtype = ObjectType::from_extension(ext)?;

    let is_hex = |s: &str| s.bytes().all(|b| b.is_ascii_hexdigit());
    if prefix.len() != 2 || stem.len() != 62 || !is_hex(prefix) || !is_hex(stem) {
        return None;
    }
    Some((format!("{}{}", prefix, stem), objtype))
}
