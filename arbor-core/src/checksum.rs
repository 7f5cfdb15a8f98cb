//! Object checksum engine
//!
//! A content object's address is SHA-256 over:
//! 1. the entity bytes: file content, symlink target, or big-endian rdev
//!    for device nodes (nothing for other kinds)
//! 2. the stat block `uid ‖ gid ‖ mode`
//! 3. the serialized xattr blob, when one is present
//!
//! Content objects in archive repositories are decoded and hashed through
//! this path. Meta objects, and content objects in bare repositories, are
//! hashed from their literal stored form by [`checksum_literal`].

use crate::archive::parse_archived;
use crate::error::ChecksumError;
use crate::metadata::{encode_rdev, read_xattrs, EntityKind, EntityMeta, Xattrs};
use crate::object::{Checksum, ObjectType, RepoMode};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Read size used when streaming content into the digest
pub const CHUNK_SIZE: usize = 8192;

/// A filesystem entity ready to be hashed or stored
pub struct Entity {
    meta: EntityMeta,
    symlink_target: Vec<u8>,
    xattrs: Option<Vec<u8>>,
    content: Option<Box<dyn Read + Send>>,
}

impl Entity {
    /// Regular file backed by a content stream
    pub fn regular(meta: EntityMeta, content: impl Read + Send + 'static) -> Self {
        Self {
            meta,
            symlink_target: Vec::new(),
            xattrs: None,
            content: Some(Box::new(content)),
        }
    }

    pub fn symlink(meta: EntityMeta, target: impl Into<Vec<u8>>) -> Self {
        Self {
            meta,
            symlink_target: target.into(),
            xattrs: None,
            content: None,
        }
    }

    /// Device node or any other entity without a content stream
    pub fn node(meta: EntityMeta) -> Self {
        Self {
            meta,
            symlink_target: Vec::new(),
            xattrs: None,
            content: None,
        }
    }

    pub fn with_xattrs(self, xattrs: &Xattrs) -> Self {
        self.with_xattr_blob(xattrs.to_bytes())
    }

    /// Attach an already serialized xattr blob
    pub fn with_xattr_blob(mut self, blob: Vec<u8>) -> Self {
        self.xattrs = Some(blob);
        self
    }

    /// Build an entity from a filesystem node without following symlinks
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::symlink_metadata(path)?;
        let meta = EntityMeta::from_fs(&metadata);
        let entity = match meta.kind() {
            EntityKind::Regular => Entity::regular(meta, File::open(path)?),
            EntityKind::Symlink => {
                let target = std::fs::read_link(path)?;
                Entity::symlink(meta, target.as_os_str().as_bytes())
            }
            _ => Entity::node(meta),
        };
        Ok(match read_xattrs(path)? {
            Some(xattrs) => entity.with_xattrs(&xattrs),
            None => entity,
        })
    }

    pub fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    pub fn kind(&self) -> EntityKind {
        self.meta.kind()
    }

    pub fn symlink_target(&self) -> &[u8] {
        &self.symlink_target
    }

    pub fn xattr_blob(&self) -> Option<&[u8]> {
        self.xattrs.as_deref()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        EntityMeta,
        Vec<u8>,
        Option<Vec<u8>>,
        Option<Box<dyn Read + Send>>,
    ) {
        (self.meta, self.symlink_target, self.xattrs, self.content)
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("meta", &self.meta)
            .field("symlink_target", &String::from_utf8_lossy(&self.symlink_target))
            .field("xattrs", &self.xattrs.as_ref().map(|x| x.len()))
            .field("content", &self.content.is_some())
            .finish()
    }
}

fn never() -> bool {
    false
}

/// Checksum an entity
pub fn checksum_entity(entity: Entity) -> Result<Checksum, ChecksumError> {
    checksum_entity_with(entity, &never)
}

/// Checksum an entity, polling `interrupt` before every content chunk
pub fn checksum_entity_with(
    entity: Entity,
    interrupt: &dyn Fn() -> bool,
) -> Result<Checksum, ChecksumError> {
    let mut hasher = Sha256::new();

    match entity.meta.kind() {
        EntityKind::Regular => {
            let mut content = entity.content.ok_or_else(|| {
                ChecksumError::Decode("regular file entity has no content stream".into())
            })?;
            feed_stream(&mut hasher, &mut content, interrupt)?;
        }
        EntityKind::Symlink => hasher.update(&entity.symlink_target),
        EntityKind::BlockDevice | EntityKind::CharDevice => {
            hasher.update(encode_rdev(entity.meta.rdev))
        }
        EntityKind::Other => {}
    }

    hasher.update(entity.meta.stat_bytes());
    if let Some(xattrs) = &entity.xattrs {
        hasher.update(xattrs);
    }

    Ok(Checksum::from_digest(hasher))
}

/// Feed `reader` into `hasher` in fixed chunks until end of stream
fn feed_stream(
    hasher: &mut Sha256,
    reader: &mut dyn Read,
    interrupt: &dyn Fn() -> bool,
) -> Result<(), ChecksumError> {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        if interrupt() {
            return Err(ChecksumError::Interrupted);
        }
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(ChecksumError::Decode(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
        if n == 0 {
            return Ok(());
        }
    }
}

/// Hash an object from its literal stored form.
///
/// Meta objects hash their raw bytes; content objects (bare repositories)
/// hash the filesystem node the same way [`checksum_entity`] does.
pub fn checksum_literal(path: &Path, objtype: ObjectType) -> Result<Checksum, ChecksumError> {
    checksum_literal_with(path, objtype, &never)
}

pub fn checksum_literal_with(
    path: &Path,
    objtype: ObjectType,
    interrupt: &dyn Fn() -> bool,
) -> Result<Checksum, ChecksumError> {
    if objtype.is_meta() {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        feed_stream(&mut hasher, &mut file, interrupt)?;
        Ok(Checksum::from_digest(hasher))
    } else {
        checksum_entity_with(Entity::from_path(path)?, interrupt)
    }
}

/// Derive the checksum of a stored object, choosing the archived or literal
/// path from the repository mode and object type.
pub fn compute_checksum(
    objtype: ObjectType,
    mode: RepoMode,
    path: &Path,
) -> Result<Checksum, ChecksumError> {
    compute_checksum_with(objtype, mode, path, &never)
}

pub fn compute_checksum_with(
    objtype: ObjectType,
    mode: RepoMode,
    path: &Path,
    interrupt: &dyn Fn() -> bool,
) -> Result<Checksum, ChecksumError> {
    if mode.uses_archive_encoding(objtype) {
        let entity = parse_archived(path)?.into_entity();
        checksum_entity_with(entity, interrupt)
    } else {
        checksum_literal_with(path, objtype, interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const HELLO_1000: &str = "eef4e5f0c34642122ead47aa462bde296ec71ef20d8dda189f2c17f7c72b5dab";

    fn file(uid: u32, gid: u32, mode: u32, data: &[u8]) -> Entity {
        Entity::regular(EntityMeta::new(uid, gid, mode), std::io::Cursor::new(data.to_vec()))
    }

    /// Reader that hands out at most `step` bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_known_regular_file_vector() {
        let sum = checksum_entity(file(1000, 1000, 0o100644, b"hello")).unwrap();
        assert_eq!(sum.to_hex(), HELLO_1000);
    }

    #[test]
    fn test_known_symlink_vector() {
        let entity = Entity::symlink(EntityMeta::new(0, 0, 0o120777), "/usr/bin");
        assert_eq!(
            checksum_entity(entity).unwrap().to_hex(),
            "6d9bf59873bbc7543b3a51c31aed0b7b098f8e31b511929158388b0eaf1a28da"
        );
    }

    #[test]
    fn test_known_device_vector() {
        let entity = Entity::node(EntityMeta::new(0, 0, 0o020666).with_rdev(0x0103));
        assert_eq!(
            checksum_entity(entity).unwrap().to_hex(),
            "e3ea1073ec8e2cbca345f9992e2771dfde48b717a48231635bf52bedd72be03e"
        );
    }

    #[test]
    fn test_known_xattr_vector() {
        let mut xattrs = Xattrs::new();
        xattrs.insert("user.k", "v");
        let entity = file(1000, 1000, 0o100644, b"hello").with_xattrs(&xattrs);
        assert_eq!(
            checksum_entity(entity).unwrap().to_hex(),
            "84db5a0ede6d0b8f2c0a5ff8d4ea48960149d350e15aa5670e923b681ae22092"
        );
    }

    #[test]
    fn test_other_kind_hashes_metadata_only() {
        let dir = Entity::node(EntityMeta::new(1000, 1000, 0o040755));
        let expected = Checksum::of_bytes(&EntityMeta::new(1000, 1000, 0o040755).stat_bytes());
        assert_eq!(checksum_entity(dir).unwrap(), expected);
    }

    #[test]
    fn test_rdev_ignored_for_regular_files() {
        let a = checksum_entity(file(0, 0, 0o100644, b"x")).unwrap();
        let entity = Entity::regular(
            EntityMeta::new(0, 0, 0o100644).with_rdev(7),
            std::io::Cursor::new(b"x".to_vec()),
        );
        assert_eq!(checksum_entity(entity).unwrap(), a);
    }

    #[test]
    fn test_short_reads_do_not_end_stream() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let whole = checksum_entity(file(1, 2, 0o100600, &data)).unwrap();
        let trickle = Trickle {
            data,
            pos: 0,
            step: 3,
        };
        let sum = checksum_entity(Entity::regular(EntityMeta::new(1, 2, 0o100600), trickle)).unwrap();
        assert_eq!(sum, whole);
    }

    #[test]
    fn test_regular_without_stream_is_decode_error() {
        let entity = Entity::node(EntityMeta::new(0, 0, 0o100644));
        assert!(matches!(checksum_entity(entity), Err(ChecksumError::Decode(_))));
    }

    #[test]
    fn test_interrupt_stops_computation() {
        let result = checksum_entity_with(file(0, 0, 0o100644, b"data"), &|| true);
        assert!(matches!(result, Err(ChecksumError::Interrupted)));
    }

    #[test]
    fn test_read_fault_is_io_error() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            }
        }
        let entity = Entity::regular(EntityMeta::new(0, 0, 0o100644), Broken);
        assert!(matches!(checksum_entity(entity), Err(ChecksumError::Io(_))));
    }

    #[test]
    fn test_meta_literal_hashes_raw_bytes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("obj.commit");
        std::fs::write(&path, b"commit-body").unwrap();
        assert_eq!(
            checksum_literal(&path, ObjectType::Commit).unwrap().to_hex(),
            "914f1102611067e7d572095039abc419a0d14086cd849d37cdc92feb0af1999b"
        );
    }

    #[test]
    fn test_bare_literal_matches_canonical_layout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello");
        std::fs::write(&path, b"hello").unwrap();

        let metadata = std::fs::symlink_metadata(&path).unwrap();
        let meta = EntityMeta::from_fs(&metadata);
        let mut canonical = b"hello".to_vec();
        canonical.extend_from_slice(&meta.stat_bytes());
        if let Some(xattrs) = read_xattrs(&path).unwrap() {
            canonical.extend_from_slice(&xattrs.to_bytes());
        }

        let sum = checksum_literal(&path, ObjectType::File).unwrap();
        assert_eq!(sum, Checksum::of_bytes(&canonical));
        assert_eq!(compute_checksum(ObjectType::File, RepoMode::Bare, &path).unwrap(), sum);
    }

    #[test]
    fn test_bare_literal_symlink_uses_target() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("link");
        std::os::unix::fs::symlink("target/file", &path).unwrap();

        let meta = EntityMeta::from_fs(&std::fs::symlink_metadata(&path).unwrap());
        let mut canonical = b"target/file".to_vec();
        canonical.extend_from_slice(&meta.stat_bytes());
        if let Some(xattrs) = read_xattrs(&path).unwrap() {
            canonical.extend_from_slice(&xattrs.to_bytes());
        }
        assert_eq!(
            checksum_literal(&path, ObjectType::File).unwrap(),
            Checksum::of_bytes(&canonical)
        );
    }

    #[test]
    fn test_archived_path_matches_entity_checksum() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.archive");
        let out = File::create(&path).unwrap();
        crate::archive::write_archived(out, file(1000, 1000, 0o100644, b"hello")).unwrap();

        let sum = compute_checksum(ObjectType::File, RepoMode::Archive, &path).unwrap();
        assert_eq!(sum.to_hex(), HELLO_1000);
    }

    #[test]
    fn test_missing_literal_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let result = checksum_literal(&tmp.path().join("absent"), ObjectType::DirTree);
        assert!(matches!(result, Err(ChecksumError::Io(_))));
    }

    proptest! {
        #[test]
        fn prop_deterministic(data in proptest::collection::vec(any::<u8>(), 0..4096),
                              uid: u32, gid: u32, perms in 0u32..0o7777) {
            let mode = 0o100000 | perms;
            let a = checksum_entity(file(uid, gid, mode, &data)).unwrap();
            let b = checksum_entity(file(uid, gid, mode, &data)).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_content_byte_flip_changes_checksum(
            data in proptest::collection::vec(any::<u8>(), 1..2048),
            idx: prop::sample::Index,
        ) {
            let mut flipped = data.clone();
            let i = idx.index(flipped.len());
            flipped[i] ^= 0xff;
            let a = checksum_entity(file(0, 0, 0o100644, &data)).unwrap();
            let b = checksum_entity(file(0, 0, 0o100644, &flipped)).unwrap();
            prop_assert_ne!(a, b);
        }

        #[test]
        fn prop_metadata_sensitivity(uid in 0u32..u32::MAX, gid in 0u32..u32::MAX,
                                     perms in 0u32..0o7777) {
            let mode = 0o100000 | perms;
            let base = checksum_entity(file(uid, gid, mode, b"payload")).unwrap();
            prop_assert_ne!(base, checksum_entity(file(uid + 1, gid, mode, b"payload")).unwrap());
            prop_assert_ne!(base, checksum_entity(file(uid, gid + 1, mode, b"payload")).unwrap());
            prop_assert_ne!(base, checksum_entity(file(uid, gid, mode ^ 0o1, b"payload")).unwrap());
        }

        #[test]
        fn prop_symlink_target_sensitivity(a in "[a-z/]{1,32}", b in "[a-z/]{1,32}") {
            prop_assume!(a != b);
            let meta = EntityMeta::new(0, 0, 0o120777);
            let sa = checksum_entity(Entity::symlink(meta, a.as_bytes())).unwrap();
            let sb = checksum_entity(Entity::symlink(meta, b.as_bytes())).unwrap();
            prop_assert_ne!(sa, sb);
        }

        #[test]
        fn prop_xattrs_added_then_removed(value in proptest::collection::vec(any::<u8>(), 0..64)) {
            let plain = checksum_entity(file(5, 5, 0o100644, b"body")).unwrap();
            let mut xattrs = Xattrs::new();
            xattrs.insert("user.tag", value);
            let tagged = checksum_entity(file(5, 5, 0o100644, b"body").with_xattrs(&xattrs)).unwrap();
            prop_assert_ne!(plain, tagged);
            let restored = checksum_entity(file(5, 5, 0o100644, b"body")).unwrap();
            prop_assert_eq!(plain, restored);
        }
    }
}
