//! Arbor Core Library
//!
//! Content-addressed storage for versioned filesystem trees:
//! - Object model (content files, directory trees/metadata, commits)
//! - Metadata codec for ownership, mode and extended attributes
//! - Archived encoding for content objects
//! - Checksum engine deriving object addresses
//! - Loose object repository (bare and archive modes)
//! - Consistency checker (fsck)

pub mod archive;
pub mod checksum;
pub mod error;
pub mod fsck;
pub mod metadata;
pub mod object;
pub mod repository;

pub use archive::{parse_archived, write_archived, ArchivedEntity};
pub use checksum::{
    checksum_entity, checksum_entity_with, checksum_literal, compute_checksum,
    compute_checksum_with, Entity, CHUNK_SIZE,
};
pub use error::{ChecksumError, FsckError, ObjectError, RepoError};
pub use fsck::{check, check_with, FsckOptions, FsckReport, ObjectFailure};
pub use metadata::{EntityKind, EntityMeta, Xattrs};
pub use object::{Checksum, ObjectType, RepoMode, ARCHIVE_SUFFIX};
pub use repository::{ObjectEntry, ObjectIter, Repository};
