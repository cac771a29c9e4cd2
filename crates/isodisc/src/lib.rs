//! isodisc
//!
//! A library for creating, reading, growing and updating multi-session
//! ISO 9660 images on arbitrary block-addressable storage: regular files,
//! block devices, and optical media backends.
//!
//! The pieces fit together like this: a [`source::BlockSource`] gives
//! uniform 2048-byte block access; [`medium::classify`] inspects it and
//! fabricates disc status and table of contents where the backend cannot
//! report them; [`loader::load_image`] reads the selected session through
//! a [`cache::TiledCache`] into a [`tree::NodeTree`];
//! [`planner::commit_session`] writes the tree back as a new session and
//! maintains the 64 KiB header copy at LBA 0 that makes emulated
//! multi-session media mountable; [`update::UpdateEngine`] reconciles a
//! disk subtree with an image subtree. All user-visible reporting goes
//! through the [`isodisc_msg::MessageBus`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod addr;
pub mod cache;
pub mod exclude;
pub mod loader;
pub mod medium;
pub mod planner;
pub mod source;
pub mod toc;
pub mod tree;
pub mod update;
pub mod volume;

pub use addr::LoadAddress;
pub use cache::{Displacement, TiledCache};
pub use exclude::{ExcludeMatch, ExcludeMode, Exclusions};
pub use loader::{Image, LoadedFeatures, PlainIso9660Builder, ReadOptions, TreeBuilder, load_image};
pub use medium::{ClassifiedMedium, ClassifyOptions, EmulationMode, classify};
pub use planner::{CommitOutcome, WriteOptions, WritePlan, WriteType, commit_session, plan_write};
pub use source::{
    BLOCK_SIZE, BlockSource, Capacity, DiscStatus, DriveAddress, FileSource, MemSource,
    SourceCaps, SourceRole, StdOutSource, open_address, parse_drive_address,
};
pub use toc::{Toc, TocEntry};
pub use tree::{Extent, FileContent, HiddenMask, Node, NodeKind, NodeTree};
pub use update::{
    CompareOptions, DiffMask, ExtractOptions, UpdateAction, UpdateEngine, UpdateSummary, extract,
};

// The message bus types appear throughout the public API.
pub use isodisc_msg::{Channel, Message, MessageBus, Severity};

/// Errors of this crate, grouped by kind: transport, format, state,
/// resource, policy, and programming errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Transport
    #[error("read failed at block {lba}: {source}")]
    ReadFailed {
        lba: u64,
        source: std::io::Error,
    },
    #[error("write failed at block {lba}: {source}")]
    WriteFailed {
        lba: u64,
        source: std::io::Error,
    },
    #[error("block {lba} is out of range (capacity {capacity} blocks)")]
    OutOfRange { lba: u64, capacity: u64 },
    #[error("this source is not readable")]
    NotReadable,
    /// Both the tile read-ahead and the direct block read failed.
    #[error("data source mishap at block {0}")]
    DataSourceMishap(u32),
    /// Displacement arithmetic left the 32-bit block address range.
    #[error("displacement offset leads outside the block address range")]
    DisplaceRollover,

    // Format
    #[error("no ISO 9660 image recognized")]
    NotAnIso,
    #[error("superblock failed its sanity check")]
    BadSuperblock,

    // State
    #[error("image changes pending; commit or rollback first")]
    ChangesPending,
    #[error("drive and medium state are unsuitable")]
    DiscUnsuitable,
    #[error("incompatible write mode: {0}")]
    BadWriteMode(String),
    #[error("{0}")]
    WrongState(String),

    // Resource
    #[error("cache geometry rejected: {tiles} tiles x {tile_blocks} blocks")]
    BadGeometry { tiles: usize, tile_blocks: u32 },
    #[error("too many symbolic link hops (limit {0})")]
    TooManyLinkHops(u32),

    // Policy
    #[error("bad value: {0}")]
    BadValue(String),
    #[error("bad pattern: {0}")]
    BadPattern(String),
    #[error("operation aborted on request")]
    Aborted,

    // Programming / tree state
    #[error("not found in image: {0}")]
    NotFound(String),
    #[error("already exists in image: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("assertion failed: {0}")]
    AssertFailure(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The message severity a failure of this kind carries.
    pub fn severity(&self) -> Severity {
        match self {
            Error::ReadFailed { .. }
            | Error::WriteFailed { .. }
            | Error::OutOfRange { .. }
            | Error::NotReadable
            | Error::DataSourceMishap(_) => Severity::Sorry,
            Error::Aborted => Severity::Mishap,
            Error::NotAnIso | Error::BadSuperblock => Severity::Warning,
            Error::DisplaceRollover
            | Error::ChangesPending
            | Error::DiscUnsuitable
            | Error::BadWriteMode(_)
            | Error::WrongState(_)
            | Error::BadValue(_)
            | Error::BadPattern(_)
            | Error::BadGeometry { .. }
            | Error::TooManyLinkHops(_)
            | Error::NotFound(_)
            | Error::AlreadyExists(_)
            | Error::NotADirectory(_)
            | Error::DirectoryNotEmpty(_)
            | Error::Io(_) => Severity::Failure,
            Error::AssertFailure(_) => Severity::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Cooperative abort request, inspected at natural loop boundaries: per
/// directory entry, per content chunk, per TOC scan step. An observed
/// abort unwinds with [`Error::Aborted`] without leaking tiles or nodes.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_to_abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_flag_is_shared() {
        let flag = AbortFlag::new();
        let other = flag.clone();
        assert!(!flag.is_requested());
        other.request_to_abort();
        assert!(flag.is_requested());
        flag.clear();
        assert!(!other.is_requested());
    }

    #[test]
    fn error_severities_follow_the_taxonomy() {
        assert_eq!(Error::DataSourceMishap(5).severity(), Severity::Sorry);
        assert_eq!(Error::NotAnIso.severity(), Severity::Warning);
        assert_eq!(Error::DiscUnsuitable.severity(), Severity::Failure);
        assert_eq!(
            Error::AssertFailure("broken").severity(),
            Severity::Fatal
        );
        assert_eq!(Error::Aborted.severity(), Severity::Mishap);
    }
}
