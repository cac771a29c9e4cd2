//! Byte-exact ISO 9660 volume structures.
//!
//! The classifier and the plain session reader/writer share these: the
//! primary volume descriptor, directory records with both-endian integer
//! fields, and the MBR partition heuristics used to recognize images with
//! an embedded partition offset.

use bytemuck::{Pod, Zeroable};
use chrono::{Datelike, Timelike, Utc};

use crate::source::BLOCK_SIZE;

/// Blocks reserved for a session head: system area plus volume descriptors.
/// Also the alignment of session start addresses (64 KiB).
pub const SESSION_HEAD_BLOCKS: u32 = 32;

/// Byte size of the session head / the emulated-TOC header copy at LBA 0.
pub const HEAD_SIZE: usize = SESSION_HEAD_BLOCKS as usize * BLOCK_SIZE;

/// Byte offset of the PVD inside a session: logical block 16.
pub const PVD_OFFSET: usize = 16 * BLOCK_SIZE;

/// A 16-bit value recorded in both byte orders, as ECMA-119 demands.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct U16LsbMsb {
    lsb: [u8; 2],
    msb: [u8; 2],
}

impl U16LsbMsb {
    pub fn new(value: u16) -> Self {
        Self {
            lsb: value.to_le_bytes(),
            msb: value.to_be_bytes(),
        }
    }

    pub fn get(&self) -> u16 {
        u16::from_le_bytes(self.lsb)
    }

    pub fn set(&mut self, value: u16) {
        self.lsb = value.to_le_bytes();
        self.msb = value.to_be_bytes();
    }
}

/// A 32-bit value recorded in both byte orders.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct U32LsbMsb {
    lsb: [u8; 4],
    msb: [u8; 4],
}

impl U32LsbMsb {
    pub fn new(value: u32) -> Self {
        Self {
            lsb: value.to_le_bytes(),
            msb: value.to_be_bytes(),
        }
    }

    pub fn get(&self) -> u32 {
        u32::from_le_bytes(self.lsb)
    }

    pub fn set(&mut self, value: u32) {
        self.lsb = value.to_le_bytes();
        self.msb = value.to_be_bytes();
    }
}

/// Directory record timestamp: years since 1900, then month, day, hour,
/// minute, second, timezone offset.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RecordDateTime {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub offset: u8,
}

impl RecordDateTime {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            year: (now.year() - 1900) as u8,
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
            offset: 0,
        }
    }

    pub fn from_epoch(secs: i64) -> Self {
        let dt = chrono::DateTime::from_timestamp(secs, 0).unwrap_or_default();
        Self {
            year: (dt.year() - 1900).clamp(0, 255) as u8,
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
            second: dt.second() as u8,
            offset: 0,
        }
    }

    pub fn to_epoch(&self) -> i64 {
        let date = chrono::NaiveDate::from_ymd_opt(
            self.year as i32 + 1900,
            self.month.max(1) as u32,
            self.day.max(1) as u32,
        );
        let time = chrono::NaiveTime::from_hms_opt(
            self.hour as u32,
            self.minute as u32,
            self.second as u32,
        );
        match (date, time) {
            (Some(d), Some(t)) => d.and_time(t).and_utc().timestamp(),
            _ => 0,
        }
    }
}

bitflags::bitflags! {
    /// Flag byte of a directory record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u8 {
        const HIDDEN = 0b0000_0001;
        const DIRECTORY = 0b0000_0010;
        const ASSOCIATED_FILE = 0b0000_0100;
        const EXTENDED_ATTRIBUTES = 0b0000_1000;
        const EXTENDED_PERMISSIONS = 0b0001_0000;
        const NOT_FINAL = 0b1000_0000;
    }
}

/// Fixed-layout head of a directory record; the identifier that follows is
/// variable length.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DirectoryRecordHeader {
    pub len: u8,
    pub extended_attr_record: u8,
    /// Start LBA of the extent.
    pub extent: U32LsbMsb,
    /// Length of the data in bytes.
    pub data_len: U32LsbMsb,
    pub date_time: RecordDateTime,
    pub flags: u8,
    pub file_unit_size: u8,
    pub interleave_gap_size: u8,
    pub volume_sequence_number: U16LsbMsb,
    pub file_identifier_len: u8,
}

pub const DIRECTORY_RECORD_HEADER_LEN: usize = 33;
const _: () = assert!(size_of::<DirectoryRecordHeader>() == DIRECTORY_RECORD_HEADER_LEN);

impl Default for DirectoryRecordHeader {
    fn default() -> Self {
        Self {
            len: 0,
            extended_attr_record: 0,
            extent: U32LsbMsb::new(0),
            data_len: U32LsbMsb::new(0),
            date_time: RecordDateTime::default(),
            flags: 0,
            file_unit_size: 0,
            interleave_gap_size: 0,
            volume_sequence_number: U16LsbMsb::new(1),
            file_identifier_len: 0,
        }
    }
}

impl DirectoryRecordHeader {
    pub fn is_directory(&self) -> bool {
        FileFlags::from_bits_retain(self.flags).contains(FileFlags::DIRECTORY)
    }

    pub fn is_final_extent(&self) -> bool {
        !FileFlags::from_bits_retain(self.flags).contains(FileFlags::NOT_FINAL)
    }
}

/// A complete directory record: header plus identifier bytes.
#[derive(Debug, Clone)]
pub struct DirectoryRecord {
    pub header: DirectoryRecordHeader,
    pub name: Vec<u8>,
}

impl DirectoryRecord {
    pub fn new(name: &[u8], extent: u32, data_len: u32, flags: FileFlags, mtime: i64) -> Self {
        let mut header = DirectoryRecordHeader {
            len: Self::record_len(name.len()),
            extent: U32LsbMsb::new(extent),
            data_len: U32LsbMsb::new(data_len),
            date_time: RecordDateTime::from_epoch(mtime),
            flags: flags.bits(),
            file_identifier_len: name.len() as u8,
            ..Default::default()
        };
        header.volume_sequence_number = U16LsbMsb::new(1);
        Self {
            header,
            name: name.to_vec(),
        }
    }

    /// Total on-disk length of a record with the given identifier length,
    /// padded to an even byte count.
    pub fn record_len(name_len: usize) -> u8 {
        ((DIRECTORY_RECORD_HEADER_LEN + name_len + 1) & !1) as u8
    }

    pub fn size(&self) -> usize {
        self.header.len as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.extend_from_slice(bytemuck::bytes_of(&self.header));
        bytes.extend_from_slice(&self.name);
        while bytes.len() < self.size() {
            bytes.push(0);
        }
        bytes
    }

    /// Parses one record at the start of `bytes`. Returns `None` on a zero
    /// length byte, which terminates the records of a block.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes[0] == 0 {
            return None;
        }
        let len = bytes[0] as usize;
        if len < DIRECTORY_RECORD_HEADER_LEN || len > bytes.len() {
            return None;
        }
        let header: DirectoryRecordHeader =
            *bytemuck::from_bytes(&bytes[..DIRECTORY_RECORD_HEADER_LEN]);
        let name_len = header.file_identifier_len as usize;
        if DIRECTORY_RECORD_HEADER_LEN + name_len > len {
            return None;
        }
        let name =
            bytes[DIRECTORY_RECORD_HEADER_LEN..DIRECTORY_RECORD_HEADER_LEN + name_len].to_vec();
        Some(Self { header, name })
    }

    /// '\x00' and '\x01' identify the directory itself and its parent.
    pub fn is_dot_entry(&self) -> bool {
        self.name == [0x00] || self.name == [0x01]
    }
}

/// The primary volume descriptor, byte-exact per ECMA-119.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct PrimaryVolumeDescriptor {
    pub type_code: u8,
    pub std_identifier: [u8; 5],
    pub version: u8,
    unused1: u8,
    pub system_id: [u8; 32],
    pub volume_id: [u8; 32],
    unused2: [u8; 8],
    pub volume_space_size: U32LsbMsb,
    unused3: [u8; 32],
    pub volume_set_size: U16LsbMsb,
    pub volume_sequence_number: U16LsbMsb,
    pub logical_block_size: U16LsbMsb,
    pub path_table_size: U32LsbMsb,
    pub type_l_path_table: [u8; 4],
    pub opt_type_l_path_table: [u8; 4],
    pub type_m_path_table: [u8; 4],
    pub opt_type_m_path_table: [u8; 4],
    pub root_dir_record: [u8; 34],
    pub volume_set_id: [u8; 128],
    pub publisher_id: [u8; 128],
    pub data_preparer_id: [u8; 128],
    pub application_id: [u8; 128],
    pub copyright_file_id: [u8; 37],
    pub abstract_file_id: [u8; 37],
    pub bibliographic_file_id: [u8; 37],
    pub creation_time: [u8; 17],
    pub modification_time: [u8; 17],
    pub expiration_time: [u8; 17],
    pub effective_time: [u8; 17],
    pub file_structure_version: u8,
    reserved1: u8,
    pub application_use: [u8; 512],
    reserved2: [u8; 653],
}

const _: () = assert!(size_of::<PrimaryVolumeDescriptor>() == BLOCK_SIZE);

impl PrimaryVolumeDescriptor {
    pub fn from_block(block: &[u8]) -> &Self {
        bytemuck::from_bytes(&block[..BLOCK_SIZE])
    }

    pub fn new(volume_id: &str, space_size: u32) -> Self {
        let mut pvd = Self::zeroed();
        pvd.type_code = 1;
        pvd.std_identifier = *b"CD001";
        pvd.version = 1;
        pvd.system_id = space_padded(b"");
        pvd.volume_id = space_padded(volume_id.as_bytes());
        pvd.volume_space_size = U32LsbMsb::new(space_size);
        pvd.volume_set_size = U16LsbMsb::new(1);
        pvd.volume_sequence_number = U16LsbMsb::new(1);
        pvd.logical_block_size = U16LsbMsb::new(BLOCK_SIZE as u16);
        pvd.volume_set_id = space_padded(b"");
        pvd.publisher_id = space_padded(b"");
        pvd.data_preparer_id = space_padded(b"");
        pvd.application_id = space_padded(b"ISODISC");
        pvd.copyright_file_id = space_padded(b"");
        pvd.abstract_file_id = space_padded(b"");
        pvd.bibliographic_file_id = space_padded(b"");
        let stamp = dec_datetime_now();
        pvd.creation_time = stamp;
        pvd.modification_time = stamp;
        pvd.expiration_time = dec_datetime_zero();
        pvd.effective_time = dec_datetime_zero();
        pvd.file_structure_version = 1;
        pvd
    }

    pub fn set_root_record(&mut self, extent: u32, data_len: u32, mtime: i64) {
        let record = DirectoryRecord::new(&[0x00], extent, data_len, FileFlags::DIRECTORY, mtime);
        let bytes = record.to_bytes();
        self.root_dir_record[..bytes.len()].copy_from_slice(&bytes);
    }

    pub fn root_record(&self) -> Option<DirectoryRecord> {
        DirectoryRecord::parse(&self.root_dir_record)
    }

    pub fn set_path_tables(&mut self, l_lba: u32, m_lba: u32, size: u32) {
        self.path_table_size = U32LsbMsb::new(size);
        self.type_l_path_table = l_lba.to_le_bytes();
        self.type_m_path_table = m_lba.to_be_bytes();
    }
}

fn space_padded<const N: usize>(text: &[u8]) -> [u8; N] {
    let mut out = [b' '; N];
    let len = text.len().min(N);
    out[..len].copy_from_slice(&text[..len]);
    out
}

fn dec_datetime_now() -> [u8; 17] {
    let now = Utc::now();
    let text = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}{:02}",
        now.year().clamp(0, 9999),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.nanosecond() / 10_000_000
    );
    let mut out = [b'0'; 17];
    out[..16].copy_from_slice(text.as_bytes());
    out[16] = 0;
    out
}

fn dec_datetime_zero() -> [u8; 17] {
    let mut out = [b'0'; 17];
    out[16] = 0;
    out
}

/// A block is a primary volume descriptor iff byte 0 is 1 and bytes 1..6
/// read "CD001".
pub fn recognize_pvd(block: &[u8]) -> bool {
    block.len() >= 6 && block[0] == 1 && &block[1..6] == b"CD001"
}

/// Recognizes the deliberately invalidated signature written by the erase
/// emulation.
pub fn recognize_invalidated_pvd(block: &[u8]) -> bool {
    block.len() >= 6
        && (&block[1..6] == b"CDXX1" || (&block[1..6] == b"CDxx1" && block[0] == b'x'))
}

/// Sanity beyond the signature: descriptor version and file structure
/// version must both be 1.
pub fn pvd_sanity_ok(block: &[u8]) -> bool {
    block.len() > 881 && block[0] == 1 && block[6] == 1 && block[881] == 1
}

/// Volume space size: 32-bit little-endian at byte 80.
pub fn volume_space_size(block: &[u8]) -> u32 {
    u32::from_le_bytes([block[80], block[81], block[82], block[83]])
}

/// Volume identifier: bytes 40..72, space padded.
pub fn volume_id(block: &[u8]) -> String {
    let raw = &block[40..72];
    let text: String = raw.iter().map(|&b| b as char).collect();
    text.trim_end_matches(' ').to_string()
}

/// Patches "CD001" to "CDXX1" in the PVD of a 64 KiB head buffer, keeping
/// the image restorable by hand but unrecognizable to loaders.
pub fn invalidate_pvd_signature(head: &mut [u8]) {
    head[PVD_OFFSET + 1..PVD_OFFSET + 6].copy_from_slice(b"CDXX1");
}

/// Builds the volume descriptor set terminator block.
pub fn terminator_block() -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = 255;
    block[1..6].copy_from_slice(b"CD001");
    block[6] = 1;
    block
}

/// Checks the MBR of a 64 KiB head for a credible first partition: boot
/// signature present, status 0x00 or 0x80, nonzero CHS start, LBA start and
/// size aligned to 2 KiB, enough room for volume descriptors, and the
/// partition end matching the image end. Returns the start offset in
/// 2048-byte blocks.
pub fn credible_partition_offset(head: &[u8], image_blocks: u32) -> Option<u32> {
    if head.len() < 512 || head[510] != 0x55 || head[511] != 0xAA {
        return None;
    }
    let part = &head[446..462];
    if part[0] != 0x80 && part[0] != 0x00 {
        return None;
    }
    if part[1] == 0 && part[2] == 0 && part[3] == 0 {
        // Zero C/H/S start address
        return None;
    }
    let start_sectors = u32::from_le_bytes([part[8], part[9], part[10], part[11]]);
    let size_sectors = u32::from_le_bytes([part[12], part[13], part[14], part[15]]);
    if start_sectors < 64 {
        return None;
    }
    if start_sectors % 4 != 0 || size_sectors % 4 != 0 {
        return None;
    }
    if size_sectors / 4 < 72 {
        // No room for volume descriptors
        return None;
    }
    let offset = start_sectors / 4;
    let blocks = size_sectors / 4;
    if offset + blocks != image_blocks {
        return None;
    }
    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pvd_recognition_is_byte_exact() {
        let mut block = [0u8; BLOCK_SIZE];
        assert!(!recognize_pvd(&block));
        block[0] = 1;
        block[1..6].copy_from_slice(b"CD001");
        assert!(recognize_pvd(&block));
        block[0] = 2;
        assert!(!recognize_pvd(&block));
        block[0] = 1;
        block[5] = b'2';
        assert!(!recognize_pvd(&block));
    }

    #[test]
    fn volume_space_size_is_little_endian_at_80() {
        let mut block = [0u8; BLOCK_SIZE];
        block[80] = 0x44;
        block[81] = 0x33;
        block[82] = 0x22;
        block[83] = 0x11;
        assert_eq!(volume_space_size(&block), 0x11223344);
    }

    #[test]
    fn built_pvd_parses_back() {
        let pvd = PrimaryVolumeDescriptor::new("BACKUP", 1234);
        let bytes = bytemuck::bytes_of(&pvd);
        assert!(recognize_pvd(bytes));
        assert!(pvd_sanity_ok(bytes));
        assert_eq!(volume_space_size(bytes), 1234);
        assert_eq!(volume_id(bytes), "BACKUP");
    }

    #[test]
    fn invalidated_signature_is_recognized() {
        let mut head = vec![0u8; HEAD_SIZE];
        let pvd = PrimaryVolumeDescriptor::new("X", 64);
        head[PVD_OFFSET..PVD_OFFSET + BLOCK_SIZE].copy_from_slice(bytemuck::bytes_of(&pvd));
        invalidate_pvd_signature(&mut head);
        let block = &head[PVD_OFFSET..PVD_OFFSET + BLOCK_SIZE];
        assert!(!recognize_pvd(block));
        assert!(recognize_invalidated_pvd(block));
    }

    #[test]
    fn directory_record_roundtrip() {
        let record = DirectoryRecord::new(b"HELLO.TXT;1", 40, 3, FileFlags::empty(), 0);
        let bytes = record.to_bytes();
        assert_eq!(bytes.len() % 2, 0);
        let parsed = DirectoryRecord::parse(&bytes).unwrap();
        assert_eq!(parsed.name, b"HELLO.TXT;1");
        assert_eq!(parsed.header.extent.get(), 40);
        assert_eq!(parsed.header.data_len.get(), 3);
        assert!(!parsed.header.is_directory());
    }

    #[test]
    fn partition_entry_credibility() {
        let image_blocks = 1000u32;
        let mut head = vec![0u8; HEAD_SIZE];
        head[510] = 0x55;
        head[511] = 0xAA;
        let part_start = 64u32; // blocks
        let part = &mut head[446..462];
        part[0] = 0x80;
        part[1] = 1; // nonzero CHS
        part[8..12].copy_from_slice(&(part_start * 4).to_le_bytes());
        part[12..16].copy_from_slice(&((image_blocks - part_start) * 4).to_le_bytes());
        assert_eq!(credible_partition_offset(&head, image_blocks), Some(64));

        // Partition end not matching the image end is rejected.
        assert_eq!(credible_partition_offset(&head, image_blocks + 1), None);

        // Unaligned start is rejected.
        head[446 + 8..446 + 12].copy_from_slice(&(part_start * 4 + 2).to_le_bytes());
        assert_eq!(credible_partition_offset(&head, image_blocks), None);
    }
}
