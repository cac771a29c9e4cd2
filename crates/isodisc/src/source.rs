//! Block-addressed storage backends.
//!
//! Everything the library reads or writes goes through a [`BlockSource`]:
//! a uniform view of 2048-byte logical blocks over an optical drive, a
//! regular file, a block device, or a write-only pipe. The trait also
//! carries the introspection the medium classifier needs (role, profile,
//! capability bits, raw disc status).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Size of one logical block in bytes.
pub const BLOCK_SIZE: usize = 2048;

/// Upper bound used for optimistic reads when a block device cannot report
/// its size. Reads simply run into a natural I/O error at the real end.
pub const CAPACITY_SENTINEL: u64 = 0x7fff_fff0;

/// Backend capacity in 2048-byte blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Known(u64),
    Unknown,
}

impl Capacity {
    pub fn known(self) -> Option<u64> {
        match self {
            Capacity::Known(blocks) => Some(blocks),
            Capacity::Unknown => None,
        }
    }

    /// Readable block count, substituting the optimistic sentinel when the
    /// backend cannot tell.
    pub fn readable_or_sentinel(self) -> u64 {
        self.known().unwrap_or(CAPACITY_SENTINEL)
    }
}

/// What kind of storage object backs a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    /// A real optical drive speaking MMC.
    OpticalMmc,
    RegularFile,
    BlockDevice,
    /// Standard output or another write-only stream.
    PipeOut,
    CharDevice,
}

/// Capability record of a source.
#[derive(Debug, Clone, Copy)]
pub struct SourceCaps {
    /// Random-access writes with an explicit start address are permitted.
    pub start_adr: bool,
    /// The source can be read at random addresses.
    pub random_read: bool,
    /// The source is exclusively owned by this process.
    pub exclusive: bool,
    /// Whether the source accepts writes at all.
    pub writable: bool,
    /// Byte granularity of write start addresses.
    pub start_alignment: u64,
}

/// Raw disc status as the backend reports it, before any emulation.
/// `Empty` is only ever reported by real drives without a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscStatus {
    Blank,
    Appendable,
    Closed,
    Empty,
    Unsuitable,
    Unready,
}

/// Formatting state of the medium, used to recognize intermediate DVD-RW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatStatus {
    Unformatted,
    Formatted,
    Unknown,
}

/// Session/track entry as reported by a backend that has a real TOC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTocEntry {
    pub session: u32,
    pub track: u32,
    pub start_lba: u32,
    pub blocks: u32,
}

/// Uniform read/write access to 2048-byte logical blocks.
///
/// At most one [`TiledCache`](crate::cache::TiledCache) may own a source at
/// a time; two concurrent readers are forbidden.
pub trait BlockSource: Send {
    /// Reads `buf.len() / 2048` blocks starting at `lba`. `buf` must be a
    /// multiple of [`BLOCK_SIZE`]. Reads beyond a known capacity fail with
    /// [`Error::OutOfRange`], reads on a write-only role with
    /// [`Error::NotReadable`].
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()>;

    fn read_capacity(&mut self) -> Capacity;

    fn role(&self) -> SourceRole;

    fn caps(&self) -> SourceCaps;

    /// Writes `buf.len() / 2048` blocks at `lba`. Requires `caps().start_adr`
    /// except for pipe-out roles, which only accept sequential appends.
    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()>;

    /// Truncates a file-backed source to the given block count.
    fn truncate_to(&mut self, blocks: u64) -> Result<()>;

    /// Gives the backend up. Further calls are not allowed.
    fn release(&mut self) -> Result<()>;

    /// MMC profile code (0x13 = DVD-RW restricted overwrite, 0x08 = CD-R).
    /// File-backed sources report 0.
    fn profile(&self) -> u16 {
        0x0000
    }

    fn disc_status(&mut self) -> DiscStatus;

    fn format_status(&self) -> FormatStatus {
        FormatStatus::Formatted
    }

    /// Number of tracks the backend itself reports, across all sessions.
    fn track_count(&mut self) -> u32 {
        0
    }

    /// A real table of contents, if the backend has one.
    fn raw_toc(&mut self) -> Option<Vec<RawTocEntry>> {
        None
    }

    /// Open sessions the backend reports. Emulation never fabricates any.
    fn incomplete_sessions(&mut self) -> u32 {
        0
    }

    /// Next writable address in blocks, if the backend tracks one.
    fn next_writable_address(&mut self) -> Option<u64> {
        None
    }

    /// Whether the backend would accept the given write type. File backends
    /// accept anything.
    fn precheck_write_type(&mut self, _tao: bool) -> bool {
        true
    }
}

/// Address descriptor parsed from the textual drive address syntax.
///
/// `stdio:/path` selects a file-backed source, `stdio:-` and
/// `stdio:/dev/fd/1` select standard output (write-only), anything else is
/// handed to the optical backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveAddress {
    /// File or block device behind `stdio:`.
    Stdio(PathBuf),
    /// The process's standard output; pipe-out only.
    StdOut,
    /// A device file for the optical backend.
    Device(PathBuf),
}

pub fn parse_drive_address(adr: &str) -> DriveAddress {
    if let Some(rest) = adr.strip_prefix("stdio:") {
        if rest == "-" || rest == "/dev/fd/1" {
            return DriveAddress::StdOut;
        }
        return DriveAddress::Stdio(PathBuf::from(rest));
    }
    DriveAddress::Device(PathBuf::from(adr))
}

/// File-backed block source for regular files and block devices.
pub struct FileSource {
    file: File,
    role: SourceRole,
    exclusive: bool,
    released: bool,
}

impl FileSource {
    /// Opens (or creates) a regular file or block device for read/write
    /// block access.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let meta = file.metadata()?;
        let role = {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileTypeExt;
                let ft = meta.file_type();
                if ft.is_block_device() {
                    SourceRole::BlockDevice
                } else if ft.is_char_device() {
                    SourceRole::CharDevice
                } else {
                    SourceRole::RegularFile
                }
            }
            #[cfg(not(unix))]
            {
                SourceRole::RegularFile
            }
        };
        Ok(Self {
            file,
            role,
            exclusive: false,
            released: false,
        })
    }

    /// Opens an existing file read-only-by-convention (writes still fail at
    /// the OS level if the permissions forbid them).
    pub fn open_existing(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mut src = Self {
            file,
            role: SourceRole::RegularFile,
            exclusive: false,
            released: false,
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            let ft = src.file.metadata()?.file_type();
            if ft.is_block_device() {
                src.role = SourceRole::BlockDevice;
            } else if ft.is_char_device() {
                src.role = SourceRole::CharDevice;
            }
        }
        Ok(src)
    }

    fn check_released(&self) -> Result<()> {
        if self.released {
            return Err(Error::AssertFailure("block source already released"));
        }
        Ok(())
    }
}

impl BlockSource for FileSource {
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.check_released()?;
        debug_assert!(buf.len() % BLOCK_SIZE == 0);
        if self.role == SourceRole::PipeOut {
            return Err(Error::NotReadable);
        }
        if let Capacity::Known(capacity) = self.read_capacity() {
            let blocks = (buf.len() / BLOCK_SIZE) as u64;
            if lba + blocks > capacity {
                return Err(Error::OutOfRange { lba, capacity });
            }
        }
        self.file.seek(SeekFrom::Start(lba * BLOCK_SIZE as u64))?;
        self.file
            .read_exact(buf)
            .map_err(|source| Error::ReadFailed { lba, source })
    }

    fn read_capacity(&mut self) -> Capacity {
        match self.role {
            SourceRole::RegularFile => match self.file.metadata() {
                Ok(meta) => Capacity::Known(meta.len() / BLOCK_SIZE as u64),
                Err(_) => Capacity::Unknown,
            },
            SourceRole::BlockDevice => match self.file.seek(SeekFrom::End(0)) {
                Ok(len) => Capacity::Known(len / BLOCK_SIZE as u64),
                Err(_) => Capacity::Unknown,
            },
            _ => Capacity::Unknown,
        }
    }

    fn role(&self) -> SourceRole {
        self.role
    }

    fn caps(&self) -> SourceCaps {
        SourceCaps {
            start_adr: self.role != SourceRole::PipeOut,
            random_read: self.role != SourceRole::PipeOut,
            exclusive: self.exclusive,
            writable: true,
            start_alignment: BLOCK_SIZE as u64,
        }
    }

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        self.check_released()?;
        debug_assert!(buf.len() % BLOCK_SIZE == 0);
        self.file.seek(SeekFrom::Start(lba * BLOCK_SIZE as u64))?;
        self.file
            .write_all(buf)
            .map_err(|source| Error::WriteFailed { lba, source })?;
        Ok(())
    }

    fn truncate_to(&mut self, blocks: u64) -> Result<()> {
        self.check_released()?;
        self.file.set_len(blocks * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        self.file.flush()?;
        Ok(())
    }

    fn disc_status(&mut self) -> DiscStatus {
        match self.read_capacity() {
            Capacity::Known(0) => DiscStatus::Blank,
            Capacity::Known(_) => DiscStatus::Closed,
            Capacity::Unknown => DiscStatus::Unready,
        }
    }
}

/// Write-only block source over the process's standard output. Blocks are
/// accepted strictly in ascending order; reads are refused.
pub struct StdOutSource {
    next_lba: u64,
    released: bool,
}

impl StdOutSource {
    pub fn new() -> Self {
        Self {
            next_lba: 0,
            released: false,
        }
    }
}

impl Default for StdOutSource {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockSource for StdOutSource {
    fn read_blocks(&mut self, _lba: u64, _buf: &mut [u8]) -> Result<()> {
        Err(Error::NotReadable)
    }

    fn read_capacity(&mut self) -> Capacity {
        Capacity::Unknown
    }

    fn role(&self) -> SourceRole {
        SourceRole::PipeOut
    }

    fn caps(&self) -> SourceCaps {
        SourceCaps {
            start_adr: false,
            random_read: false,
            exclusive: false,
            writable: true,
            start_alignment: BLOCK_SIZE as u64,
        }
    }

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        if self.released {
            return Err(Error::AssertFailure("block source already released"));
        }
        if lba != self.next_lba {
            return Err(Error::BadWriteMode(format!(
                "pipe output only accepts sequential writes, got block {lba}, expected {}",
                self.next_lba
            )));
        }
        let mut out = std::io::stdout().lock();
        out.write_all(buf)
            .map_err(|source| Error::WriteFailed { lba, source })?;
        self.next_lba += (buf.len() / BLOCK_SIZE) as u64;
        Ok(())
    }

    fn truncate_to(&mut self, _blocks: u64) -> Result<()> {
        Err(Error::BadWriteMode("pipe output cannot be truncated".into()))
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        std::io::stdout().lock().flush()?;
        Ok(())
    }

    fn disc_status(&mut self) -> DiscStatus {
        DiscStatus::Blank
    }

    fn next_writable_address(&mut self) -> Option<u64> {
        Some(self.next_lba)
    }
}

/// Opens the backend a textual drive address names. Bare device paths are
/// the optical backend's business; here they get plain file access.
pub fn open_address(adr: &str) -> Result<Box<dyn BlockSource>> {
    match parse_drive_address(adr) {
        DriveAddress::Stdio(path) => Ok(Box::new(FileSource::open(&path)?)),
        DriveAddress::StdOut => Ok(Box::new(StdOutSource::new())),
        DriveAddress::Device(path) => Ok(Box::new(FileSource::open(&path)?)),
    }
}

/// RAM-backed block source, mainly useful for diagnostics and fault
/// injection. Bad blocks can be marked; reading one fails like a damaged
/// sector would.
pub struct MemSource {
    data: Vec<u8>,
    role: SourceRole,
    profile: u16,
    status: DiscStatus,
    format: FormatStatus,
    bad_blocks: Vec<u64>,
    nwa: Option<u64>,
    tracks: u32,
    released: bool,
}

impl MemSource {
    pub fn new(blocks: u64) -> Self {
        Self {
            data: vec![0u8; (blocks as usize) * BLOCK_SIZE],
            role: SourceRole::RegularFile,
            profile: 0x0000,
            status: DiscStatus::Blank,
            format: FormatStatus::Formatted,
            bad_blocks: Vec::new(),
            nwa: None,
            tracks: 0,
            released: false,
        }
    }

    pub fn with_role(mut self, role: SourceRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_profile(mut self, profile: u16) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_status(mut self, status: DiscStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_format_status(mut self, format: FormatStatus) -> Self {
        self.format = format;
        self
    }

    pub fn with_nwa(mut self, nwa: u64) -> Self {
        self.nwa = Some(nwa);
        self
    }

    pub fn with_track_count(mut self, tracks: u32) -> Self {
        self.tracks = tracks;
        self
    }

    pub fn mark_bad(&mut self, lba: u64) {
        self.bad_blocks.push(lba);
    }

    pub fn fill(&mut self, lba: u64, bytes: &[u8]) {
        let at = (lba as usize) * BLOCK_SIZE;
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl BlockSource for MemSource {
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        if self.released {
            return Err(Error::AssertFailure("block source already released"));
        }
        let blocks = (buf.len() / BLOCK_SIZE) as u64;
        let capacity = (self.data.len() / BLOCK_SIZE) as u64;
        if lba + blocks > capacity {
            return Err(Error::OutOfRange { lba, capacity });
        }
        for bad in &self.bad_blocks {
            if *bad >= lba && *bad < lba + blocks {
                return Err(Error::ReadFailed {
                    lba: *bad,
                    source: std::io::Error::other("bad block"),
                });
            }
        }
        let at = (lba as usize) * BLOCK_SIZE;
        buf.copy_from_slice(&self.data[at..at + buf.len()]);
        Ok(())
    }

    fn read_capacity(&mut self) -> Capacity {
        Capacity::Known((self.data.len() / BLOCK_SIZE) as u64)
    }

    fn role(&self) -> SourceRole {
        self.role
    }

    fn caps(&self) -> SourceCaps {
        SourceCaps {
            start_adr: self.role != SourceRole::OpticalMmc || self.profile != 0x08,
            random_read: true,
            exclusive: true,
            writable: true,
            start_alignment: BLOCK_SIZE as u64,
        }
    }

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        if self.released {
            return Err(Error::AssertFailure("block source already released"));
        }
        let end = (lba as usize) * BLOCK_SIZE + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        let at = (lba as usize) * BLOCK_SIZE;
        self.data[at..at + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn truncate_to(&mut self, blocks: u64) -> Result<()> {
        self.data.truncate((blocks as usize) * BLOCK_SIZE);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        Ok(())
    }

    fn profile(&self) -> u16 {
        self.profile
    }

    fn disc_status(&mut self) -> DiscStatus {
        self.status
    }

    fn format_status(&self) -> FormatStatus {
        self.format
    }

    fn track_count(&mut self) -> u32 {
        self.tracks
    }

    fn next_writable_address(&mut self) -> Option<u64> {
        self.nwa
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_address_syntax() {
        assert_eq!(
            parse_drive_address("stdio:/tmp/image.iso"),
            DriveAddress::Stdio(PathBuf::from("/tmp/image.iso"))
        );
        assert_eq!(parse_drive_address("stdio:-"), DriveAddress::StdOut);
        assert_eq!(parse_drive_address("stdio:/dev/fd/1"), DriveAddress::StdOut);
        assert_eq!(
            parse_drive_address("/dev/sr0"),
            DriveAddress::Device(PathBuf::from("/dev/sr0"))
        );
    }

    #[test]
    fn mem_source_read_write_roundtrip() {
        let mut src = MemSource::new(8);
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xAB;
        src.write_blocks(3, &block).unwrap();

        let mut readback = [0u8; BLOCK_SIZE];
        src.read_blocks(3, &mut readback).unwrap();
        assert_eq!(readback[0], 0xAB);
    }

    #[test]
    fn out_of_range_read_is_rejected() {
        let mut src = MemSource::new(4);
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            src.read_blocks(4, &mut buf),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn released_source_refuses_io() {
        let mut src = MemSource::new(4);
        src.release().unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            src.read_blocks(0, &mut buf),
            Err(Error::AssertFailure(_))
        ));
    }
}
