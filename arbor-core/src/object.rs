//! Object identity for the arbor store
//!
//! An object is named by `(checksum, object type)`. Object types are split
//! into meta types (commits and directory descriptions) and content types
//! (file entities); archival encoding only ever applies to content.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Filename suffix marking a content object stored in archived encoding
pub const ARCHIVE_SUFFIX: &str = ".archive";

/// SHA-256 content address of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Create a checksum from raw digest bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Finalize a running digest
    pub fn from_digest(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }

    /// Checksum of a byte slice taken as a whole
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Lowercase hexadecimal form, as used in object file names
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64 character hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    /// A filesystem entity: regular file, symlink or device node
    File,
    /// Directory listing
    DirTree,
    /// Directory ownership, permissions and xattrs
    DirMeta,
    Commit,
}

impl ObjectType {
    pub const ALL: [ObjectType; 4] = [
        ObjectType::File,
        ObjectType::DirTree,
        ObjectType::DirMeta,
        ObjectType::Commit,
    ];

    /// Whether the stored bytes are a structural description rather than content
    pub fn is_meta(self) -> bool {
        !matches!(self, ObjectType::File)
    }

    /// Loose object file extension (without the leading dot)
    pub fn extension(self) -> &'static str {
        match self {
            ObjectType::File => "file",
            ObjectType::DirTree => "dirtree",
            ObjectType::DirMeta => "dirmeta",
            ObjectType::Commit => "commit",
        }
    }

    /// Map a loose object file extension back to its type.
    ///
    /// Both `file` and `archive` name content objects; which one is valid
    /// depends on the repository mode.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "file" | "archive" => Some(ObjectType::File),
            "dirtree" => Some(ObjectType::DirTree),
            "dirmeta" => Some(ObjectType::DirMeta),
            "commit" => Some(ObjectType::Commit),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(ObjectType::File),
            "dirtree" => Ok(ObjectType::DirTree),
            "dirmeta" => Ok(ObjectType::DirMeta),
            "commit" => Ok(ObjectType::Commit),
            other => Err(format!("unknown object type '{}'", other)),
        }
    }
}

/// How content objects are laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoMode {
    /// Content objects are stored in the archived encoding
    Archive,
    /// Content objects are literal filesystem nodes
    Bare,
}

impl RepoMode {
    /// Whether objects of `objtype` need the bespoke archived checksum path
    pub fn uses_archive_encoding(self, objtype: ObjectType) -> bool {
        self == RepoMode::Archive && !objtype.is_meta()
    }

    /// On-disk file name suffix for an object of `objtype`
    pub fn object_suffix(self, objtype: ObjectType) -> String {
        if self.uses_archive_encoding(objtype) {
            ARCHIVE_SUFFIX.to_string()
        } else {
            format!(".{}", objtype.extension())
        }
    }
}

impl fmt::Display for RepoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoMode::Archive => f.write_str("archive"),
            RepoMode::Bare => f.write_str("bare"),
        }
    }
}

impl FromStr for RepoMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archive" => Ok(RepoMode::Archive),
            "bare" => Ok(RepoMode::Bare),
            other => Err(format!("unknown repository mode '{}'", other)),
        }
    }
}
