//! Medium classification and multi-session emulation.
//!
//! [`classify`] inspects a block source and produces a [`ClassifiedMedium`]
//! handle: the real or fabricated disc status, an emulated table of
//! contents where the backend cannot report one, the next writable address,
//! and the captured session head used for the header copy at LBA 0.
//!
//! On random-access media (files, block devices, DVD+RW style media) the
//! multi-session layout is a convention: a 64 KiB header copy at LBA 0
//! points readers at the most interesting session, and the sessions
//! themselves form a chain of 32-block-aligned headers, each announcing its
//! own length.

use std::sync::Arc;

use isodisc_msg::{Channel, MessageBus, Severity};

use crate::source::{
    BLOCK_SIZE, BlockSource, Capacity, DiscStatus, FormatStatus, SourceCaps, SourceRole,
};
use crate::toc::{Toc, TocEntry};
use crate::volume::{
    HEAD_SIZE, PVD_OFFSET, SESSION_HEAD_BLOCKS, credible_partition_offset,
    invalidate_pvd_signature, pvd_sanity_ok, recognize_invalidated_pvd, recognize_pvd,
    volume_id, volume_space_size,
};
use crate::{Error, Result};

/// Error-code namespace of this library on the message bus.
pub(crate) const MSG_CODE: u32 = 0x0006_0000;

/// Session start alignment in blocks.
pub const NWA_ALIGNMENT: u32 = 32;

/// growisofs aligns to 16 blocks rather than 32; scans probe 16 blocks
/// early where that gap can occur.
const GROWISOFS_ALIGNMENT: u32 = 16;

/// Free scans give up after this many blocks without a session header.
pub const TOC_SCAN_MAX_GAP: u32 = 65_536;

/// Largest adoptable partition offset: the head buffer may grow to 1 MiB.
const MAX_PARTITION_OFFSET: u32 = 512 - SESSION_HEAD_BLOCKS;

/// MMC profile of DVD-RW in restricted overwrite.
const PROFILE_DVD_RW_RESTRICTED: u16 = 0x13;
/// MMC profile of CD-R, whose TOC can be trusted.
const PROFILE_CD_R: u16 = 0x08;

/// Named behavior switches of [`classify`].
#[derive(Debug, Clone, Default)]
pub struct ClassifyOptions {
    /// Cooperative abort flag, observed at every TOC scan step.
    pub abort: crate::AbortFlag,
    /// Treat an overwriteable medium as blank regardless of content.
    pub pretend_blank: bool,
    /// On -ROM profiles, scan for session headers to build a TOC.
    pub probe_rom_by_scan: bool,
    /// Do not emulate a TOC on overwriteable media; represent the medium
    /// as a single session.
    pub no_emul_toc: bool,
    /// Ignore ACL information from external filesystems.
    pub ignore_acl: bool,
    /// Ignore POSIX extended attributes from external filesystems.
    pub ignore_xattr: bool,
    /// Pretend a -ROM profile and scan for a table of contents.
    pub pretend_rom: bool,
    /// When scanning for sessions, do not demand a valid superblock at
    /// LBA 0; scan until the end of the medium.
    pub scan_without_lba0_header: bool,
    /// Restore the historical mapping of unsuitable read-only media to
    /// "closed". Off by default: the real state is reported.
    pub legacy_rom_status: bool,
}

/// How the medium is being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationMode {
    /// The backend handles multi-session itself.
    None,
    /// Multi-session is emulated on a random-access backend.
    Overwriteable,
    /// Classification failed; every higher-level call reports
    /// [`Error::DiscUnsuitable`].
    Unsuitable,
}

/// Classified state of one acquired drive/medium pair. All later
/// operations are threaded through this handle.
pub struct ClassifiedMedium {
    drive: Option<Box<dyn BlockSource>>,
    bus: Arc<MessageBus>,
    pub profile: u16,
    pub role: SourceRole,
    pub random_access: bool,
    caps: SourceCaps,
    format: FormatStatus,
    emulation: EmulationMode,
    backend_status: DiscStatus,
    fabricated_status: Option<DiscStatus>,
    emulated_toc: Option<Vec<TocEntry>>,
    /// Next writable address in blocks.
    pub nwa: u32,
    /// Where a first session would start; 0 signals "not a first session".
    pub zero_nwa: u32,
    pub min_start_byte: u64,
    /// Captured head of the image: 64 KiB plus partition-offset growth.
    target_head: Vec<u8>,
    media_read_error: bool,
    loaded_partition_offset: u32,
    partition_offset_adopted: bool,
    fabricated_msc1: Option<u32>,
    fabricated_msc2: Option<u32>,
    pub ignore_acl: bool,
    pub ignore_xattr: bool,
    /// Truncate file backends to the session end after writing.
    pub truncate_enabled: bool,
    pub(crate) wrote_well: Option<bool>,
    abort: crate::AbortFlag,
}

/// Inspects the drive and produces the classified handle.
///
/// A failure that leaves the medium unusable is recorded in the handle as
/// [`EmulationMode::Unsuitable`] instead of being returned; subsequent
/// calls on the handle report [`Error::DiscUnsuitable`].
pub fn classify(
    drive: Box<dyn BlockSource>,
    opts: &ClassifyOptions,
    bus: Arc<MessageBus>,
) -> ClassifiedMedium {
    let mut drive = drive;
    let backend_status = drive.disc_status();
    let profile = drive.profile();
    let caps = drive.caps();
    let role = drive.role();
    let format = drive.format_status();
    let readonly = opts.pretend_rom || !caps.writable;
    let random_access = caps.start_adr || role == SourceRole::RegularFile;

    let mut medium = ClassifiedMedium {
        drive: Some(drive),
        bus,
        profile,
        role,
        random_access,
        caps,
        format,
        emulation: if random_access {
            EmulationMode::Overwriteable
        } else {
            EmulationMode::None
        },
        backend_status,
        fabricated_status: None,
        emulated_toc: None,
        nwa: SESSION_HEAD_BLOCKS,
        zero_nwa: SESSION_HEAD_BLOCKS,
        min_start_byte: 0,
        target_head: vec![0u8; HEAD_SIZE],
        media_read_error: false,
        loaded_partition_offset: 0,
        partition_offset_adopted: false,
        fabricated_msc1: None,
        fabricated_msc2: None,
        ignore_acl: opts.ignore_acl,
        ignore_xattr: opts.ignore_xattr,
        truncate_enabled: false,
        wrote_well: None,
        abort: opts.abort.clone(),
    };

    if random_access && !readonly {
        if medium.is_intermediate_dvd_rw() {
            // Unwritten formatted DVD-RW must start its first session at 0.
            medium.min_start_byte = 0;
            medium.nwa = 0;
            medium.zero_nwa = 0;
        }
        if opts.pretend_blank
            && role != SourceRole::PipeOut
            && role != SourceRole::CharDevice
        {
            medium.nwa = medium.zero_nwa;
            medium.fabricated_status = Some(DiscStatus::Blank);
        } else {
            if medium.start_emulation(false).is_err() {
                medium.emulation = EmulationMode::Unsuitable;
                return medium;
            }
            if medium
                .emulate_toc(TocScan {
                    free_scan: opts.scan_without_lba0_header,
                    single_session: opts.no_emul_toc,
                })
                .is_err()
            {
                medium.emulation = EmulationMode::Unsuitable;
                return medium;
            }
        }
    } else {
        if readonly && backend_status != DiscStatus::Empty {
            if opts.legacy_rom_status {
                // The old behavior reported such media as plainly closed.
                medium.fabricated_status = Some(DiscStatus::Closed);
            }

            // A medium bearing two or more backend tracks cannot be an
            // overwriteable with emulated sessions. Count before scanning.
            let track_count = medium
                .drive
                .as_mut()
                .map(|d| d.track_count())
                .unwrap_or(0);
            tracing::debug!(track_count, "ROM medium backend track count");

            let mut emulation_started = false;
            let mut found = false;
            if !opts.no_emul_toc && track_count < 2 {
                if medium.start_emulation(true).is_err() {
                    medium.emulation = EmulationMode::Unsuitable;
                    return medium;
                }
                emulation_started = true;
                match medium.emulate_toc(TocScan {
                    free_scan: opts.scan_without_lba0_header,
                    single_session: false,
                }) {
                    Ok(ok) => {
                        found = ok;
                        if ok {
                            medium.emulation = EmulationMode::Overwriteable;
                        }
                    }
                    Err(_) => {
                        medium.emulation = EmulationMode::Unsuitable;
                        return medium;
                    }
                }
            }
            if !found
                && (profile != PROFILE_CD_R || opts.pretend_rom)
                && opts.probe_rom_by_scan
            {
                // Multi-session media without a decent TOC. CD-R TOCs can
                // be trusted; others get a scan search for session headers.
                if !emulation_started && medium.start_emulation(true).is_err() {
                    medium.emulation = EmulationMode::Unsuitable;
                    return medium;
                }
                if medium
                    .emulate_toc(TocScan {
                        free_scan: true,
                        single_session: false,
                    })
                    .unwrap_or(false)
                {
                    // Point msc1 to the last found session.
                    medium.fabricated_msc1 = medium
                        .emulated_toc
                        .as_ref()
                        .and_then(|t| t.last())
                        .map(|e| e.start_lba);
                }
            }
        }
        if let Some(nwa) = medium.drive.as_mut().and_then(|d| d.next_writable_address()) {
            medium.nwa = nwa as u32;
        }
        if medium.nwa < medium.zero_nwa {
            medium.zero_nwa = 0;
        }
    }

    medium
}

/// Scan mode for [`ClassifiedMedium::emulate_toc`].
#[derive(Debug, Clone, Copy, Default)]
struct TocScan {
    /// Scan without demanding a superblock at LBA 0, stepping over gaps.
    free_scan: bool,
    /// Represent the medium as one single session.
    single_session: bool,
}

impl ClassifiedMedium {
    pub fn emulation_mode(&self) -> EmulationMode {
        self.emulation
    }

    pub fn caps(&self) -> SourceCaps {
        self.caps
    }

    /// The disc status after emulation: fabricated value if one was set,
    /// else derived from the write position on emulated media, else the
    /// backend's own report.
    pub fn status(&self) -> DiscStatus {
        match self.emulation {
            EmulationMode::Unsuitable => DiscStatus::Unsuitable,
            _ => {
                if let Some(status) = self.fabricated_status {
                    return status;
                }
                match self.emulation {
                    EmulationMode::Overwriteable => {
                        if self.nwa > self.zero_nwa {
                            DiscStatus::Appendable
                        } else {
                            DiscStatus::Blank
                        }
                    }
                    _ => self.backend_status,
                }
            }
        }
    }

    pub fn is_intermediate_dvd_rw(&self) -> bool {
        self.profile == PROFILE_DVD_RW_RESTRICTED
            && self.backend_status == DiscStatus::Blank
            && self.format != FormatStatus::Formatted
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.emulation == EmulationMode::Unsuitable {
            self.bus.submit_text(
                MSG_CODE,
                Severity::Failure,
                Channel::Info,
                "Unsuitable drive and medium state",
            );
            return Err(Error::DiscUnsuitable);
        }
        Ok(())
    }

    /// Detaches the drive from the handle, e.g. to hand it to a cache or
    /// to reclassify after external changes.
    pub fn take_drive(&mut self) -> Result<Box<dyn BlockSource>> {
        self.ensure_usable()?;
        self.drive
            .take()
            .ok_or(Error::AssertFailure("drive is already detached"))
    }

    /// Hands a drive back to the handle.
    pub fn attach_drive(&mut self, drive: Box<dyn BlockSource>) {
        self.drive = Some(drive);
    }

    pub(crate) fn drive_mut(&mut self) -> Result<&mut Box<dyn BlockSource>> {
        self.ensure_usable()?;
        self.drive
            .as_mut()
            .ok_or(Error::AssertFailure("drive is already detached"))
    }

    /// Gives the drive up for good.
    pub fn release(&mut self) -> Result<()> {
        if let Some(mut drive) = self.drive.take() {
            drive.release()?;
        }
        Ok(())
    }

    /// The table of contents: backend-reported where available, else the
    /// emulated session list.
    pub fn toc(&mut self) -> Toc {
        if let Some(entries) = &self.emulated_toc {
            return Toc::from_entries(entries);
        }
        if let Some(drive) = self.drive.as_mut() {
            if let Some(raw) = drive.raw_toc() {
                let entries: Vec<TocEntry> = raw
                    .iter()
                    .map(|r| TocEntry {
                        session: r.session,
                        track: r.track,
                        start_lba: r.start_lba,
                        blocks: r.blocks,
                        volid: None,
                        emulated: false,
                    })
                    .collect();
                let mut toc = Toc::from_entries(&entries);
                toc.incomplete_sessions = drive.incomplete_sessions();
                return toc;
            }
        }
        Toc::default()
    }

    /// Start LBA of the session the next load should pick: the fabricated
    /// override if one is pending (it is consumed by this call), else the
    /// last session of the TOC.
    pub fn msc1(&mut self) -> Result<u32> {
        self.ensure_usable()?;
        if let Some(msc1) = self.fabricated_msc1.take() {
            return Ok(msc1);
        }
        if let Some(start) = self.toc().last_session_start() {
            return Ok(start);
        }
        Err(Error::NotAnIso)
    }

    /// Sets the single-shot msc1 override consumed by the next load.
    pub fn set_fabricated_msc1(&mut self, lba: u32) {
        self.fabricated_msc1 = Some(lba);
    }

    /// Overrides the write address of the next session ("blind growing").
    /// While set, the header copy at LBA 0 is left untouched.
    pub fn set_fabricated_msc2(&mut self, lba: u32) {
        self.fabricated_msc2 = Some(lba);
    }

    pub(crate) fn fabricated_msc2(&self) -> Option<u32> {
        self.fabricated_msc2
    }

    /// Recognized partition offset of the loaded image, with a flag telling
    /// whether the head buffer was grown to cover it.
    pub fn partition_offset(&self) -> (u32, bool) {
        (self.loaded_partition_offset, self.partition_offset_adopted)
    }

    /// The buffered image head: 64 KiB plus any adopted partition offset.
    pub fn target_head(&self) -> &[u8] {
        &self.target_head
    }

    pub(crate) fn set_target_head(&mut self, head: Vec<u8>) {
        self.target_head = head;
    }

    pub(crate) fn set_status_after_commit(&mut self, nwa: u32) {
        self.nwa = nwa;
        self.min_start_byte = nwa as u64 * BLOCK_SIZE as u64;
        self.fabricated_status = Some(DiscStatus::Appendable);
    }

    pub(crate) fn append_emulated_session(&mut self, start_lba: u32, blocks: u32, volid: Option<String>) {
        let entries = self.emulated_toc.get_or_insert_with(Vec::new);
        let session = entries.len() as u32 + 1;
        entries.push(TocEntry {
            session,
            track: session,
            start_lba,
            blocks,
            volid,
            emulated: true,
        });
    }

    /// Whether the drive wrote the last session successfully; `None` while
    /// nothing has been written.
    pub fn wrote_well(&self) -> Option<bool> {
        self.wrote_well
    }

    /// Sets the minimum start byte for the next write and derives the
    /// aligned next writable address from it.
    pub fn set_start_byte(&mut self, value: u64) -> Result<()> {
        if !self.caps.start_adr {
            self.bus.submit_text(
                MSG_CODE,
                Severity::Failure,
                Channel::Info,
                "Cannot set start byte address with this type of media",
            );
            return Err(Error::BadWriteMode(
                "start address not settable on this medium".into(),
            ));
        }
        self.min_start_byte = value;
        let mut value = value;
        let alignment = self.caps.start_alignment.max(1);
        if value % alignment != 0 {
            value += alignment - value % alignment;
        }
        self.nwa = (value / BLOCK_SIZE as u64) as u32;
        if self.nwa < self.zero_nwa {
            self.zero_nwa = 0;
        }
        // Round up to the 32-block session alignment where the medium
        // alignment permits it.
        if self.nwa % NWA_ALIGNMENT != 0
            && (NWA_ALIGNMENT as u64 * BLOCK_SIZE as u64) % alignment == 0
        {
            self.nwa += NWA_ALIGNMENT - self.nwa % NWA_ALIGNMENT;
        }
        Ok(())
    }

    /// Reads the first 64 KiB and fabricates the disc status from what is
    /// found there: all zero means blank, a primary volume descriptor means
    /// appendable with the image size from the volume-space field, anything
    /// else means a full medium of unknown format.
    fn start_emulation(&mut self, readonly: bool) -> Result<()> {
        if readonly {
            self.fabricated_status = Some(DiscStatus::Closed);
        }

        if self.role == SourceRole::PipeOut {
            // Random-access write-only: status comes from the backend.
            let drive = self.drive_mut()?;
            let status = drive.disc_status();
            let nwa = drive.next_writable_address();
            self.fabricated_status = Some(status);
            if let Some(nwa) = nwa {
                self.nwa = nwa as u32;
            }
            if self.nwa < self.zero_nwa {
                self.zero_nwa = 0;
            }
            return Ok(());
        }

        let capacity = {
            let drive = self.drive_mut()?;
            drive.read_capacity()
        };
        let readable_bytes = match capacity {
            Capacity::Known(blocks) => blocks * BLOCK_SIZE as u64,
            Capacity::Unknown => {
                if self.role == SourceRole::RegularFile || self.role == SourceRole::BlockDevice {
                    // Might be a block device whose size the OS cannot
                    // report. Read anyway.
                    u64::MAX
                } else {
                    if !readonly {
                        self.fabricated_status = Some(DiscStatus::Blank);
                    }
                    return Ok(());
                }
            }
        };
        if readable_bytes == 0 {
            if !readonly {
                self.fabricated_status = Some(DiscStatus::Blank);
            }
            return Ok(());
        }

        let to_read = (readable_bytes.min(HEAD_SIZE as u64) as usize) & !(BLOCK_SIZE - 1);
        let mut head = vec![0u8; HEAD_SIZE];
        let read_result = {
            let drive = self.drive_mut()?;
            drive.read_blocks(0, &mut head[..to_read.max(BLOCK_SIZE)])
        };
        self.target_head = head;
        match read_result {
            Ok(()) => {}
            Err(Error::NotReadable) => {
                self.media_read_error = true;
                self.bus.submit_text(
                    MSG_CODE,
                    Severity::Note,
                    Channel::Info,
                    "Pseudo drive does not allow reading",
                );
                self.fabricated_status = Some(DiscStatus::Blank);
                return Ok(());
            }
            Err(_) => {
                // A read error here means a disc with no ISO image.
                self.media_read_error = true;
                if capacity.known().unwrap_or(0) > 0 {
                    self.fabricated_status = Some(DiscStatus::Closed);
                } else if !readonly {
                    self.fabricated_status = Some(DiscStatus::Blank);
                }
                return Ok(());
            }
        }

        if self.target_head.iter().all(|&b| b == 0) {
            // All zero: treated as blank, overwritten without extra check.
            if !readonly {
                self.fabricated_status = Some(DiscStatus::Blank);
            }
            return Ok(());
        }

        let pvd = &self.target_head[PVD_OFFSET..PVD_OFFSET + BLOCK_SIZE];
        if recognize_pvd(pvd) {
            if !pvd_sanity_ok(pvd) {
                self.fabricated_status = Some(DiscStatus::Closed);
                return Ok(());
            }
            let size = volume_space_size(pvd);
            self.inspect_partition(size);
            // The head at LBA 0 is a copy of the first session, which
            // starts at block 32; the chain end refines this further.
            self.set_start_byte((SESSION_HEAD_BLOCKS as u64 + size as u64) * BLOCK_SIZE as u64)?;
            if !readonly {
                self.fabricated_status = Some(DiscStatus::Appendable);
            }
        } else if recognize_invalidated_pvd(pvd) {
            // A deliberately invalidated image: empty.
            self.set_start_byte(self.zero_nwa as u64 * BLOCK_SIZE as u64)?;
            if !readonly {
                self.fabricated_status = Some(DiscStatus::Blank);
            }
        } else {
            self.fabricated_status = Some(DiscStatus::Closed);
        }
        Ok(())
    }

    /// Checks the head for an MBR whose first partition credibly embeds the
    /// image at an offset. Adopts the offset and grows the head buffer when
    /// it is small enough to keep buffered.
    fn inspect_partition(&mut self, image_blocks: u32) {
        let Some(offset) = credible_partition_offset(&self.target_head, image_blocks) else {
            return;
        };
        // Demand a sane PVD at the partition start.
        let mut block = [0u8; BLOCK_SIZE];
        {
            let Ok(drive) = self.drive_mut() else { return };
            if drive
                .read_blocks(offset as u64 + 16, &mut block)
                .is_err()
            {
                return;
            }
        }
        if !recognize_pvd(&block) || !pvd_sanity_ok(&block) {
            return;
        }
        if volume_space_size(&block) + offset != image_blocks {
            return;
        }

        // Credible. Not necessarily acceptable.
        self.loaded_partition_offset = offset;
        if offset > MAX_PARTITION_OFFSET {
            self.bus.submit_text(
                MSG_CODE,
                Severity::Warning,
                Channel::Info,
                format!(
                    "Detected partition offset of {offset} blocks. Maximum for load buffer is {MAX_PARTITION_OFFSET}"
                ),
            );
            return;
        }

        let grown = HEAD_SIZE + offset as usize * BLOCK_SIZE;
        let mut head = vec![0u8; grown];
        let ok = {
            let Ok(drive) = self.drive_mut() else { return };
            drive.read_blocks(0, &mut head).is_ok()
        };
        if ok {
            self.target_head = head;
            self.partition_offset_adopted = true;
        }
    }

    /// Reads a candidate 64 KiB session head at `lba` and recognizes the
    /// PVD in its second half (block `lba + 16`). With `check_first_half`,
    /// a PVD in the first half is accepted too, meaning the session started
    /// 16 blocks before `lba` (growisofs alignment).
    fn read_iso_head(&mut self, lba: u32, check_first_half: bool) -> Option<(u32, u32, String)> {
        if self.media_read_error {
            return None;
        }
        if self.role == SourceRole::PipeOut || self.role == SourceRole::CharDevice {
            return None;
        }
        let drive = self.drive.as_mut()?;
        let capacity = drive.read_capacity().readable_or_sentinel();
        if (lba as u64) >= capacity {
            return None;
        }
        let available = (capacity - lba as u64) * BLOCK_SIZE as u64;
        if available < 36 * 1024 {
            return None;
        }
        let to_read = available.min(HEAD_SIZE as u64) as usize;
        let mut buffer = vec![0u8; HEAD_SIZE];
        if drive.read_blocks(lba as u64, &mut buffer[..to_read]).is_err() {
            return None;
        }

        if check_first_half {
            let first = &buffer[..BLOCK_SIZE];
            if recognize_pvd(first) {
                let blocks = volume_space_size(first);
                return Some((lba - GROWISOFS_ALIGNMENT, blocks, volume_id(first)));
            }
        }
        let second = &buffer[PVD_OFFSET..PVD_OFFSET + BLOCK_SIZE];
        if recognize_pvd(second) {
            let blocks = volume_space_size(second);
            return Some((lba, blocks, volume_id(second)));
        }
        None
    }

    /// Builds the emulated TOC by walking the chain of session headers.
    /// Returns whether a credible session list was found.
    fn emulate_toc(&mut self, scan: TocScan) -> Result<bool> {
        if self.fabricated_status == Some(DiscStatus::Blank) {
            return Ok(false);
        }
        let readable = {
            let drive = self.drive_mut()?;
            drive.read_capacity().readable_or_sentinel()
        };
        let readable = readable.min(u32::MAX as u64) as u32;

        let mut entries: Vec<TocEntry> = Vec::new();
        let mut scanned_blocks: u64 = 0;

        if scan.free_scan {
            // If there is a PVD at LBA 32 then this is an image with
            // emulated TOC; otherwise sessions may start at 0.
            let mut cursor = if self.read_iso_head(SESSION_HEAD_BLOCKS, false).is_some() {
                SESSION_HEAD_BLOCKS
            } else {
                0
            };
            let mut scan_start = cursor;
            while cursor < readable {
                if self.abort.is_requested() {
                    return Err(Error::Aborted);
                }
                match self.read_iso_head(cursor, !entries.is_empty()) {
                    Some((start, blocks, volid)) => {
                        let blocks = clip_to_readable(start, blocks, readable, &self.bus);
                        push_entry(&mut entries, start, blocks, Some(volid));
                        cursor = align_up(start + blocks, NWA_ALIGNMENT);
                        scan_start = cursor;
                        scanned_blocks += SESSION_HEAD_BLOCKS as u64;
                    }
                    None => {
                        if entries.is_empty() {
                            return Ok(false);
                        }
                        // Try the next 64 KiB block until the gap limit.
                        cursor += SESSION_HEAD_BLOCKS;
                        scanned_blocks += SESSION_HEAD_BLOCKS as u64;
                        if cursor - scan_start > TOC_SCAN_MAX_GAP {
                            break;
                        }
                    }
                }
            }
        } else {
            // Enclosure mode: the head copy at LBA 0 must announce an
            // image; the chain of session headers follows at block 32.
            let head_pvd = &self.target_head[PVD_OFFSET..PVD_OFFSET + BLOCK_SIZE];
            if !recognize_pvd(head_pvd) {
                return Ok(false);
            }
            let image_size = volume_space_size(head_pvd);

            if scan.single_session {
                // Represent the medium as one single session.
                let blocks = clip_to_readable(0, image_size, readable, &self.bus);
                push_entry(&mut entries, 0, blocks, None);
                self.finish_toc(entries, scanned_blocks);
                return Ok(true);
            }

            let head_blocks = (self.target_head.len() / BLOCK_SIZE) as u32;
            let mut cursor = head_blocks;
            let mut probe_minus_16 = false;
            loop {
                if self.abort.is_requested() {
                    return Err(Error::Aborted);
                }
                match self.read_iso_head(cursor, probe_minus_16) {
                    Some((start, blocks, volid)) => {
                        let blocks = clip_to_readable(start, blocks, readable, &self.bus);
                        push_entry(&mut entries, start, blocks, Some(volid));
                        scanned_blocks += SESSION_HEAD_BLOCKS as u64;
                        let end = start + blocks;
                        let growisofs_nwa = align_up(end, GROWISOFS_ALIGNMENT);
                        cursor = align_up(end, NWA_ALIGNMENT);
                        probe_minus_16 = cursor - growisofs_nwa == GROWISOFS_ALIGNMENT;
                        if cursor >= readable {
                            break;
                        }
                    }
                    None => {
                        if entries.is_empty() {
                            // Enclosure without a chain: fall back to one
                            // session covering the announced image.
                            self.bus.submit_text(
                                MSG_CODE,
                                Severity::Warning,
                                Channel::Info,
                                format!(
                                    "Chain of ISO session headers broken at LBA {cursor}"
                                ),
                            );
                            let blocks =
                                clip_to_readable(0, image_size, readable, &self.bus);
                            push_entry(&mut entries, 0, blocks, None);
                        } else {
                            tracing::debug!(cursor, "session header chain ends");
                        }
                        break;
                    }
                }
            }
        }

        if entries.is_empty() {
            return Ok(false);
        }
        self.finish_toc(entries, scanned_blocks);
        Ok(true)
    }

    fn finish_toc(&mut self, entries: Vec<TocEntry>, scanned_blocks: u64) {
        self.bus.submit_text(
            MSG_CODE,
            Severity::Update,
            Channel::Info,
            format!(
                "Found {} ISO sessions by scanning {} kB",
                entries.len(),
                2 * scanned_blocks
            ),
        );
        if let Some(last) = entries.last() {
            let end = align_up(last.start_lba + last.blocks, NWA_ALIGNMENT);
            if end > self.nwa {
                self.nwa = end;
                self.min_start_byte = end as u64 * BLOCK_SIZE as u64;
            }
        }
        self.emulated_toc = Some(entries);
    }

    /// Emulated disc erase on random-access backends: instead of a real
    /// blank command the first 64 KiB are zeroed, or the PVD signature is
    /// invalidated when a recognizable image head is buffered.
    pub fn erase(&mut self, _fast: bool) -> Result<()> {
        self.ensure_usable()?;
        if self.emulation != EmulationMode::Overwriteable || !self.caps.start_adr {
            return Err(Error::BadWriteMode(
                "medium cannot be blanked by emulation".into(),
            ));
        }
        let status = self.status();
        if status == DiscStatus::Closed {
            // Unknown data format in the first 64 kB: zero it out.
            let zeroes = vec![0u8; HEAD_SIZE];
            let drive = self.drive_mut()?;
            drive.write_blocks(0, &zeroes)?;
        } else {
            invalidate_pvd_signature(&mut self.target_head);
            let head = self.target_head.clone();
            let drive = self.drive_mut()?;
            drive.write_blocks(0, &head)?;
        }
        self.fabricated_status = Some(DiscStatus::Blank);
        self.emulated_toc = None;
        self.nwa = self.zero_nwa;
        self.min_start_byte = self.zero_nwa as u64 * BLOCK_SIZE as u64;
        Ok(())
    }

    /// Writes the buffered header copy to LBA 0, making the image set
    /// visible to plain readers. No-op while an msc2 override is pending or
    /// when the first session starts at 0.
    pub fn activate_session(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.emulation != EmulationMode::Overwriteable {
            return Ok(());
        }
        if self.fabricated_msc2.is_some() {
            // Blind growing: do not alter anything outside the session.
            return Ok(());
        }
        if self.zero_nwa == 0 {
            return Ok(());
        }
        let head = self.target_head.clone();
        let drive = self.drive_mut()?;
        drive.write_blocks(0, &head)?;
        Ok(())
    }
}

fn push_entry(entries: &mut Vec<TocEntry>, start_lba: u32, blocks: u32, volid: Option<String>) {
    let session = entries.len() as u32 + 1;
    entries.push(TocEntry {
        session,
        track: session,
        start_lba,
        blocks,
        volid: volid.filter(|v| !v.is_empty()),
        emulated: true,
    });
}

fn clip_to_readable(start: u32, blocks: u32, readable: u32, bus: &MessageBus) -> u32 {
    if start + blocks > readable {
        bus.submit_text(
            MSG_CODE,
            Severity::Warning,
            Channel::Info,
            format!(
                "ISO image size {}s larger than readable size {}s",
                start + blocks,
                readable
            ),
        );
        readable - start
    } else {
        blocks
    }
}

pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemSource;
    use crate::volume::PrimaryVolumeDescriptor;

    fn bus() -> Arc<MessageBus> {
        let bus = MessageBus::new();
        bus.set_sink(Box::new(|_| {}));
        Arc::new(bus)
    }

    fn pvd_block(volid: &str, size: u32) -> [u8; BLOCK_SIZE] {
        let pvd = PrimaryVolumeDescriptor::new(volid, size);
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(bytemuck::bytes_of(&pvd));
        block
    }

    /// Image with an LBA-0 enclosure copy and a session chain at block 32.
    fn chained_image(sessions: &[(u32, u32, &str)]) -> MemSource {
        let total = sessions
            .iter()
            .map(|(start, blocks, _)| start + blocks)
            .max()
            .unwrap_or(0)
            + SESSION_HEAD_BLOCKS;
        let mut src = MemSource::new(align_up(total, 32) as u64);
        for (start, blocks, volid) in sessions {
            src.fill(*start as u64 + 16, &pvd_block(volid, *blocks));
        }
        // Enclosure: copy of the first session head at LBA 0.
        if let Some((start, blocks, volid)) = sessions.first() {
            assert_eq!(*start, SESSION_HEAD_BLOCKS);
            src.fill(16, &pvd_block(volid, *blocks));
        }
        src
    }

    #[test]
    fn blank_file_classifies_as_blank() {
        let src = MemSource::new(1024);
        let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus());
        assert_eq!(medium.status(), DiscStatus::Blank);
        assert_eq!(medium.emulation_mode(), EmulationMode::Overwriteable);
        assert_eq!(medium.nwa, SESSION_HEAD_BLOCKS);
        assert!(medium.toc().sessions.is_empty());
    }

    #[test]
    fn single_session_image_is_appendable() {
        let src = chained_image(&[(32, 100, "FIRST")]);
        let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus());
        assert_eq!(medium.status(), DiscStatus::Appendable);
        let toc = medium.toc();
        assert_eq!(toc.session_count(), 1);
        assert_eq!(toc.sessions[0].start_lba(), 32);
        assert_eq!(toc.sessions[0].sectors(), 100);
        assert_eq!(toc.sessions[0].tracks[0].entry.volid.as_deref(), Some("FIRST"));
        // Next session starts 32-block aligned after the chain end.
        assert_eq!(medium.nwa, align_up(132, 32));
    }

    #[test]
    fn session_chain_produces_one_entry_per_header() {
        // Sessions at 32 (96 blocks -> next at 128) and 128 (64 blocks).
        let src = chained_image(&[(32, 96, "A"), (128, 64, "A")]);
        let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus());
        let toc = medium.toc();
        assert_eq!(toc.session_count(), 2);
        assert_eq!(toc.sessions[1].start_lba(), 128);
        assert_eq!(toc.total_sectors(), 192);
        assert_eq!(medium.msc1().unwrap(), 128);
    }

    #[test]
    fn free_scan_finds_sessions_behind_gaps() {
        // Three synthetic session heads at 32, 320, 640, each 256 blocks.
        let mut src = MemSource::new(1024);
        for start in [32u32, 320, 640] {
            src.fill(start as u64 + 16, &pvd_block("SCAN", 256));
        }
        let opts = ClassifyOptions {
            pretend_rom: true,
            probe_rom_by_scan: true,
            ..Default::default()
        };
        let mut medium = classify(Box::new(src), &opts, bus());
        let toc = medium.toc();
        let found: Vec<(u32, u32)> = toc
            .entries()
            .map(|e| (e.start_lba, e.blocks))
            .collect();
        assert_eq!(found, vec![(32, 256), (320, 256), (640, 256)]);
        // msc1 points at the last session, once.
        assert_eq!(medium.msc1().unwrap(), 640);
    }

    #[test]
    fn header_free_scan_follows_a_chain_from_zero() {
        // Three contiguous sessions at 0, 256 and 512, each announcing
        // its own length of 256 blocks.
        let mut src = MemSource::new(1024);
        for start in [0u32, 256, 512] {
            src.fill(start as u64 + 16, &pvd_block("CHAIN", 256));
        }
        let opts = ClassifyOptions {
            scan_without_lba0_header: true,
            ..Default::default()
        };
        let mut medium = classify(Box::new(src), &opts, bus());
        let found: Vec<(u32, u32)> = medium
            .toc()
            .entries()
            .map(|e| (e.start_lba, e.blocks))
            .collect();
        assert_eq!(found, vec![(0, 256), (256, 256), (512, 256)]);
    }

    #[test]
    fn fabricated_msc1_is_single_shot() {
        let src = chained_image(&[(32, 64, "X")]);
        let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus());
        medium.set_fabricated_msc1(9999);
        assert_eq!(medium.msc1().unwrap(), 9999);
        // Consumed: the next call answers from the TOC again.
        assert_eq!(medium.msc1().unwrap(), 32);
    }

    #[test]
    fn pretend_blank_fabricates_blank_status() {
        let src = chained_image(&[(32, 100, "FULL")]);
        let opts = ClassifyOptions {
            pretend_blank: true,
            ..Default::default()
        };
        let mut medium = classify(Box::new(src), &opts, bus());
        assert_eq!(medium.status(), DiscStatus::Blank);
        assert!(medium.toc().sessions.is_empty());
        assert_eq!(medium.nwa, medium.zero_nwa);
    }

    #[test]
    fn garbage_head_classifies_as_closed() {
        let mut src = MemSource::new(256);
        src.fill(0, &[0x5A; BLOCK_SIZE]);
        let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus());
        assert_eq!(medium.status(), DiscStatus::Closed);
        assert!(medium.toc().sessions.is_empty());
    }

    #[test]
    fn erase_invalidates_the_pvd_signature() {
        let src = chained_image(&[(32, 100, "GONE")]);
        let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus());
        assert_eq!(medium.status(), DiscStatus::Appendable);
        medium.erase(false).unwrap();
        assert_eq!(medium.status(), DiscStatus::Blank);

        // Reclassification sees the invalidated signature as blank.
        let drive = medium.take_drive().unwrap();
        let mut medium = classify(drive, &ClassifyOptions::default(), bus());
        assert_eq!(medium.status(), DiscStatus::Blank);
        assert!(medium.toc().sessions.is_empty());
    }

    #[test]
    fn intermediate_dvd_rw_forces_session_start_zero() {
        let src = MemSource::new(1024)
            .with_role(SourceRole::OpticalMmc)
            .with_profile(PROFILE_DVD_RW_RESTRICTED)
            .with_status(DiscStatus::Blank)
            .with_format_status(FormatStatus::Unknown);
        let medium = classify(Box::new(src), &ClassifyOptions::default(), bus());
        assert!(medium.is_intermediate_dvd_rw());
        assert_eq!(medium.zero_nwa, 0);
        assert_eq!(medium.nwa, 0);
        assert_eq!(medium.min_start_byte, 0);
    }

    #[test]
    fn two_track_rom_medium_skips_toc_emulation() {
        let mut src = chained_image(&[(32, 100, "TRAP")]).with_track_count(2);
        // Make the source read-only-ish by pretending a ROM profile.
        src = src.with_role(SourceRole::OpticalMmc);
        let opts = ClassifyOptions {
            pretend_rom: true,
            ..Default::default()
        };
        let mut medium = classify(Box::new(src), &opts, bus());
        assert!(medium.toc().sessions.is_empty());
    }

    #[test]
    fn partition_offset_is_adopted_when_credible() {
        let image_blocks = 1000u32;
        let offset = 64u32;
        let mut src = MemSource::new(1100);
        // Head: MBR + PVD at block 16 announcing the image.
        let mut head = vec![0u8; HEAD_SIZE];
        head[510] = 0x55;
        head[511] = 0xAA;
        head[446] = 0x80;
        head[447] = 1;
        head[446 + 8..446 + 12].copy_from_slice(&(offset * 4).to_le_bytes());
        head[446 + 12..446 + 16]
            .copy_from_slice(&((image_blocks - offset) * 4).to_le_bytes());
        src.fill(0, &head);
        src.fill(16, &pvd_block("PART", image_blocks));
        // PVD at the partition start whose size reaches the image end.
        src.fill(offset as u64 + 16, &pvd_block("PART", image_blocks - offset));
        let medium = classify(Box::new(src), &ClassifyOptions::default(), bus());
        let (loaded, adopted) = medium.partition_offset();
        assert_eq!(loaded, 64);
        assert!(adopted);
        assert_eq!(medium.target_head().len(), HEAD_SIZE + 64 * BLOCK_SIZE);
    }
}
