//! Archived encoding for content objects
//!
//! Layout of a `.archive` object:
//! ```text
//! magic       "ARBORAV1"
//! header_len  u32 BE
//! header      bincode(ArchiveHeader)
//! content     zstd frame with the file bytes (regular files only)
//! ```

use crate::checksum::Entity;
use crate::error::ChecksumError;
use crate::metadata::{EntityKind, EntityMeta};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

pub const ARCHIVE_MAGIC: &[u8; 8] = b"ARBORAV1";

/// Upper bound on header size; anything larger is treated as corruption
const MAX_HEADER_LEN: u32 = 16 * 1024 * 1024;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveHeader {
    uid: u32,
    gid: u32,
    mode: u32,
    rdev: u32,
    symlink_target: Vec<u8>,
    xattrs: Option<Vec<u8>>,
}

/// Decompressing reader over an archived file's content frame
pub struct ArchivedContent {
    decoder: zstd::stream::read::Decoder<'static, BufReader<File>>,
}

impl Read for ArchivedContent {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // zstd reports damaged frames as Other/UnexpectedEof
        self.decoder.read(buf).map_err(|e| match e.kind() {
            io::ErrorKind::Other | io::ErrorKind::UnexpectedEof => {
                io::Error::new(io::ErrorKind::InvalidData, e)
            }
            _ => e,
        })
    }
}

/// A parsed archived entity
pub struct ArchivedEntity {
    pub meta: EntityMeta,
    pub symlink_target: Vec<u8>,
    pub xattrs: Option<Vec<u8>>,
    pub content: Option<ArchivedContent>,
}

impl ArchivedEntity {
    pub fn into_entity(self) -> Entity {
        let entity = match (self.meta.kind(), self.content) {
            (EntityKind::Regular, Some(content)) => Entity::regular(self.meta, content),
            (EntityKind::Symlink, _) => Entity::symlink(self.meta, self.symlink_target),
            _ => Entity::node(self.meta),
        };
        match self.xattrs {
            Some(blob) => entity.with_xattr_blob(blob),
            None => entity,
        }
    }
}

fn decode_err(what: &'static str) -> impl Fn(io::Error) -> ChecksumError {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ChecksumError::Decode(format!("truncated archive {}", what))
        } else {
            ChecksumError::Io(e)
        }
    }
}

/// Parse an archived object file
pub fn parse_archived(path: &Path) -> Result<ArchivedEntity, ChecksumError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).map_err(decode_err("magic"))?;
    if &magic != ARCHIVE_MAGIC {
        return Err(ChecksumError::Decode(format!(
            "bad archive magic in {}",
            path.display()
        )));
    }

    let mut len = [0u8; 4];
    reader.read_exact(&mut len).map_err(decode_err("header length"))?;
    let header_len = u32::from_be_bytes(len);
    if header_len > MAX_HEADER_LEN {
        return Err(ChecksumError::Decode(format!(
            "archive header length {} exceeds limit",
            header_len
        )));
    }

    let mut raw = vec![0u8; header_len as usize];
    reader.read_exact(&mut raw).map_err(decode_err("header"))?;
    let header: ArchiveHeader = bincode::deserialize(&raw)
        .map_err(|e| ChecksumError::Decode(format!("invalid archive header: {}", e)))?;

    let meta = EntityMeta {
        uid: header.uid,
        gid: header.gid,
        mode: header.mode,
        rdev: header.rdev,
    };

    let content = if meta.kind() == EntityKind::Regular {
        if reader.fill_buf()?.is_empty() {
            return Err(ChecksumError::Decode(format!(
                "archived regular file {} has no content frame",
                path.display()
            )));
        }
        let decoder = zstd::stream::read::Decoder::with_buffer(reader)?;
        Some(ArchivedContent { decoder })
    } else {
        None
    };

    Ok(ArchivedEntity {
        meta,
        symlink_target: header.symlink_target,
        xattrs: header.xattrs,
        content,
    })
}

/// Write `entity` in archived encoding
pub fn write_archived<W: Write>(mut out: W, entity: Entity) -> Result<W, ChecksumError> {
    let (meta, symlink_target, xattrs, content) = entity.into_parts();
    let header = ArchiveHeader {
        uid: meta.uid,
        gid: meta.gid,
        mode: meta.mode,
        rdev: meta.rdev,
        symlink_target,
        xattrs,
    };
    let raw = bincode::serialize(&header)
        .map_err(|e| ChecksumError::Decode(format!("failed to encode archive header: {}", e)))?;

    out.write_all(ARCHIVE_MAGIC)?;
    out.write_all(&(raw.len() as u32).to_be_bytes())?;
    out.write_all(&raw)?;

    if meta.kind() == EntityKind::Regular {
        let mut content = content.ok_or_else(|| {
            ChecksumError::Decode("regular file entity has no content stream".into())
        })?;
        let mut encoder = zstd::stream::write::Encoder::new(out, ZSTD_LEVEL)?;
        encoder.include_checksum(true)?;
        io::copy(&mut content, &mut encoder)?;
        out = encoder.finish()?;
    }
    Ok(out)
}
