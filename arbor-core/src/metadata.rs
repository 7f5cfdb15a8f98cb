//! Metadata codec
//!
//! Fixed byte layouts mixed into content checksums:
//! - stat block: `uid ‖ gid ‖ mode`, each a big-endian `u32` (mode verbatim,
//!   file type bits included)
//! - device number: big-endian `u32`
//! - extended attributes: `count ‖ (name_len ‖ name ‖ value_len ‖ value)*`,
//!   lengths big-endian `u32`, entries sorted by name

use crate::error::ChecksumError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFDIR: u32 = 0o040000;

/// Filesystem node category, derived from the mode's type bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Regular,
    Symlink,
    BlockDevice,
    CharDevice,
    Other,
}

impl EntityKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => EntityKind::Regular,
            S_IFLNK => EntityKind::Symlink,
            S_IFBLK => EntityKind::BlockDevice,
            S_IFCHR => EntityKind::CharDevice,
            _ => EntityKind::Other,
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, EntityKind::BlockDevice | EntityKind::CharDevice)
    }
}

/// Ownership, mode and device number of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Device number; only meaningful for block and character devices
    pub rdev: u32,
}

impl EntityMeta {
    pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
        Self {
            uid,
            gid,
            mode,
            rdev: 0,
        }
    }

    pub fn with_rdev(mut self, rdev: u32) -> Self {
        self.rdev = rdev;
        self
    }

    /// Read from `lstat` results. Device numbers keep their low 32 bits.
    pub fn from_fs(metadata: &std::fs::Metadata) -> Self {
        Self {
            uid: metadata.uid(),
            gid: metadata.gid(),
            mode: metadata.mode(),
            rdev: metadata.rdev() as u32,
        }
    }

    pub fn kind(&self) -> EntityKind {
        EntityKind::from_mode(self.mode)
    }

    pub fn stat_bytes(&self) -> [u8; 12] {
        encode_stat(self.uid, self.gid, self.mode)
    }
}

/// Serialize the stat block mixed into every content checksum
pub fn encode_stat(uid: u32, gid: u32, mode: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&uid.to_be_bytes());
    buf[4..8].copy_from_slice(&gid.to_be_bytes());
    buf[8..12].copy_from_slice(&mode.to_be_bytes());
    buf
}

pub fn encode_rdev(rdev: u32) -> [u8; 4] {
    rdev.to_be_bytes()
}

/// Extended attribute set, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Xattrs(BTreeMap<Vec<u8>, Vec<u8>>);

impl Xattrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an attribute
    pub fn insert(&mut self, name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &[u8]) -> Option<&[u8]> {
        self.0.get(name).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Serialize to the self-describing blob hashed into checksums
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.0.len() * 16);
        buf.extend_from_slice(&(self.0.len() as u32).to_be_bytes());
        for (name, value) in &self.0 {
            buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
            buf.extend_from_slice(name);
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value);
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ChecksumError> {
        let mut pos = 0;
        let count = read_u32(data, &mut pos)?;
        let mut xattrs = Xattrs::new();
        for _ in 0..count {
            let name = read_chunk(data, &mut pos)?;
            let value = read_chunk(data, &mut pos)?;
            xattrs.insert(name, value);
        }
        if pos != data.len() {
            return Err(ChecksumError::Decode(format!(
                "{} trailing bytes after xattr blob",
                data.len() - pos
            )));
        }
        Ok(xattrs)
    }
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32, ChecksumError> {
    let end = *pos + 4;
    let bytes = data
        .get(*pos..end)
        .ok_or_else(|| ChecksumError::Decode("truncated xattr blob".into()))?;
    *pos = end;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_chunk<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], ChecksumError> {
    let len = read_u32(data, pos)? as usize;
    let end = *pos + len;
    let chunk = data
        .get(*pos..end)
        .ok_or_else(|| ChecksumError::Decode("truncated xattr blob".into()))?;
    *pos = end;
    Ok(chunk)
}

/// Read the extended attributes of a node without following symlinks.
///
/// Returns `None` when the node carries no attributes or the filesystem
/// does not support them.
#[cfg(target_os = "linux")]
pub fn read_xattrs(path: &Path) -> io::Result<Option<Xattrs>> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;

    let size = unsafe { libc::llistxattr(cpath.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOTSUP) {
            return Ok(None);
        }
        return Err(err);
    }
    if size == 0 {
        return Ok(None);
    }

    let mut names = vec![0u8; size as usize];
    let size = unsafe {
        libc::llistxattr(
            cpath.as_ptr(),
            names.as_mut_ptr() as *mut libc::c_char,
            names.len(),
        )
    };
    if size < 0 {
        return Err(io::Error::last_os_error());
    }
    names.truncate(size as usize);

    let mut xattrs = Xattrs::new();
    for name in names.split(|b| *b == 0).filter(|n| !n.is_empty()) {
        let cname = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "xattr name contains NUL"))?;
        let len = unsafe { libc::lgetxattr(cpath.as_ptr(), cname.as_ptr(), std::ptr::null_mut(), 0) };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut value = vec![0u8; len as usize];
        let len = unsafe {
            libc::lgetxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        value.truncate(len as usize);
        xattrs.insert(name.to_vec(), value);
    }

    if xattrs.is_empty() {
        Ok(None)
    } else {
        Ok(Some(xattrs))
    }
}

/// Apply extended attributes to a node without following symlinks
#[cfg(target_os = "linux")]
pub fn write_xattrs(path: &Path, xattrs: &Xattrs) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;
    for (name, value) in xattrs.iter() {
        let cname = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name contains NUL"))?;
        let rc = unsafe {
            libc::lsetxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn write_xattrs(_path: &Path, xattrs: &Xattrs) -> io::Result<()> {
    if xattrs.is_empty() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "extended attributes are not supported on this platform",
        ))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn read_xattrs(_path: &Path) -> io::Result<Option<Xattrs>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_layout_is_big_endian() {
        let meta = EntityMeta::new(1000, 1000, 0o100644);
        assert_eq!(hex::encode(meta.stat_bytes()), "000003e8000003e8000081a4");
    }

    #[test]
    fn test_rdev_layout() {
        assert_eq!(encode_rdev(0x0103), [0, 0, 1, 3]);
    }

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(EntityKind::from_mode(0o100644), EntityKind::Regular);
        assert_eq!(EntityKind::from_mode(0o120777), EntityKind::Symlink);
        assert_eq!(EntityKind::from_mode(0o060660), EntityKind::BlockDevice);
        assert_eq!(EntityKind::from_mode(0o020666), EntityKind::CharDevice);
        assert_eq!(EntityKind::from_mode(0o040755), EntityKind::Other);
        assert_eq!(EntityKind::from_mode(0o010644), EntityKind::Other);
        assert!(EntityKind::CharDevice.is_device());
        assert!(!EntityKind::Symlink.is_device());
    }

    #[test]
    fn test_xattr_blob_layout() {
        let mut xattrs = Xattrs::new();
        xattrs.insert(b"user.k".to_vec(), b"v".to_vec());
        assert_eq!(
            hex::encode(xattrs.to_bytes()),
            "0000000100000006757365722e6b0000000176"
        );
    }

    #[test]
    fn test_xattr_blob_sorted_by_name() {
        let mut a = Xattrs::new();
        a.insert("user.b", "2");
        a.insert("user.a", "1");
        let mut b = Xattrs::new();
        b.insert("user.a", "1");
        b.insert("user.b", "2");
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_xattr_blob_parse() {
        let mut xattrs = Xattrs::new();
        xattrs.insert("security.selinux", "system_u:object_r:bin_t:s0");
        xattrs.insert("user.empty", "");
        let parsed = Xattrs::from_bytes(&xattrs.to_bytes()).unwrap();
        assert_eq!(parsed, xattrs);
        assert_eq!(parsed.get(b"user.empty"), Some(&b""[..]));
    }

    #[test]
    fn test_xattr_blob_rejects_truncation() {
        let mut xattrs = Xattrs::new();
        xattrs.insert("user.k", "value");
        let bytes = xattrs.to_bytes();
        let err = Xattrs::from_bytes(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, ChecksumError::Decode(_)));
    }

    #[test]
    fn test_empty_xattrs_still_serialize_count() {
        assert_eq!(Xattrs::new().to_bytes(), vec![0, 0, 0, 0]);
    }
}
