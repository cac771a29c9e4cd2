//! Write planning and session commit.
//!
//! The planner decides where the next session starts and in which mode it
//! is written, serializes the node tree into a session byte stream, and
//! maintains the emulated-TOC header copy at LBA 0 that makes multi-session
//! images on random-access media readable by plain mounters.

use std::collections::HashMap;
use std::sync::Arc;

use isodisc_msg::{Channel, MessageBus, Severity};

use crate::loader::Image;
use crate::medium::{ClassifiedMedium, EmulationMode, MSG_CODE, NWA_ALIGNMENT, align_up};
use crate::source::{BLOCK_SIZE, DiscStatus, SourceRole};
use crate::tree::{ContentSource, Extent, FileContent, Node, NodeTree};
use crate::volume::{
    DirectoryRecord, FileFlags, HEAD_SIZE, PrimaryVolumeDescriptor, terminator_block,
};
use crate::{Error, Result};

/// Largest byte count a single directory-record extent can describe,
/// rounded down to a block multiple. Larger files get further extents.
const MAX_EXTENT_BYTES: u64 = 0xFFFF_F800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteType {
    #[default]
    Auto,
    Tao,
    Sao,
}

/// Caller choices for the next commit.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Explicit write start in bytes; rounded up to the medium alignment.
    pub start_byte: Option<u64>,
    pub write_type: WriteType,
    /// Extra padding appended after the session, in bytes.
    pub padding_bytes: u64,
    /// Truncate file backends to the session end after writing.
    pub truncate: bool,
    /// Maintain the 64 KiB header copy at LBA 0.
    pub emul_toc: bool,
    pub stream_recording: bool,
    /// Predicted filesystem size for media that want it up front.
    pub fs_size: Option<u64>,
    /// Re-acquire the drive as input-output after the commit.
    pub reacquire: bool,
    pub volume_id: Option<String>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            start_byte: None,
            write_type: WriteType::Auto,
            padding_bytes: 0,
            truncate: false,
            emul_toc: true,
            stream_recording: false,
            fs_size: None,
            reacquire: true,
            volume_id: None,
        }
    }
}

/// The planner's decision for one commit.
#[derive(Debug, Clone, Copy)]
pub struct WritePlan {
    pub start_lba: u32,
    pub write_type: WriteType,
    /// Always false on emulated multi-session media; the backend is not
    /// told that this is a multi-session write.
    pub multi_session: bool,
    pub emul_toc: bool,
}

/// What a finished commit reports back.
#[derive(Debug, Clone, Copy)]
pub struct CommitOutcome {
    pub start_lba: u32,
    /// Session length in blocks, without alignment padding.
    pub session_blocks: u32,
    /// Blocks actually written, alignment and padding included.
    pub written_blocks: u32,
}

/// Decides write type and start address for the next session.
pub fn plan_write(
    medium: &mut ClassifiedMedium,
    opts: &WriteOptions,
    bus: &Arc<MessageBus>,
) -> Result<WritePlan> {
    if medium.emulation_mode() == EmulationMode::Unsuitable {
        return Err(Error::DiscUnsuitable);
    }

    if let Some(start_byte) = opts.start_byte {
        medium.set_start_byte(start_byte)?;
    }

    // Unwritten formatted DVD-RW must be written sequentially from 0 on
    // first use. Anything else would need re-formatting.
    if medium.is_intermediate_dvd_rw() && medium.nwa > medium.zero_nwa {
        bus.submit_text(
            MSG_CODE,
            Severity::Failure,
            Channel::Info,
            "DVD-RW insufficiently formatted. (Intermediate State, size unknown)",
        );
        bus.submit_text(
            MSG_CODE,
            Severity::Hint,
            Channel::Info,
            "It might help to first deformat it and then format it again",
        );
        medium.wrote_well = Some(false);
        return Err(Error::BadWriteMode(
            "intermediate DVD-RW cannot take a session above block 0".into(),
        ));
    }

    let write_type = match opts.write_type {
        WriteType::Auto => {
            // The file-like backends of this crate take anything; SAO is
            // the natural choice for a one-shot session stream.
            tracing::debug!("write type auto-selected: SAO");
            WriteType::Sao
        }
        explicit => {
            let accepted = {
                let drive = medium.drive_mut()?;
                drive.precheck_write_type(explicit == WriteType::Tao)
            };
            if !accepted {
                bus.submit_text(
                    MSG_CODE,
                    Severity::Failure,
                    Channel::Info,
                    format!(
                        "Cannot set write type {} for this medium.",
                        if explicit == WriteType::Tao { "TAO" } else { "SAO" }
                    ),
                );
                medium.wrote_well = Some(false);
                return Err(Error::BadWriteMode("write type rejected by backend".into()));
            }
            bus.submit_text(
                MSG_CODE,
                Severity::Note,
                Channel::Info,
                format!(
                    "Explicitly chosen write type: {}",
                    if explicit == WriteType::Tao { "TAO" } else { "SAO" }
                ),
            );
            explicit
        }
    };

    let start_lba = medium.fabricated_msc2().unwrap_or(medium.nwa);

    Ok(WritePlan {
        start_lba,
        write_type,
        multi_session: false,
        emul_toc: opts.emul_toc,
    })
}

/// Serializes the tree and writes it as one session, then maintains the
/// header copy, the truncation of file backends, and the medium state.
pub fn commit_session(
    medium: &mut ClassifiedMedium,
    image: &mut Image,
    opts: &WriteOptions,
    bus: &Arc<MessageBus>,
) -> Result<CommitOutcome> {
    // The drive may still sit inside the image's cache from the load;
    // the planner needs it back for its prechecks.
    if let Some(drive) = image.detach_drive() {
        medium.attach_drive(drive);
    }

    let plan = plan_write(medium, opts, bus)?;
    let was_first = medium.status() == DiscStatus::Blank
        || medium.toc().sessions.is_empty();

    let volid = opts
        .volume_id
        .clone()
        .unwrap_or_else(|| image.volume_id.clone());
    let session = SessionWriter::serialize(&mut image.tree, plan.start_lba, &volid, opts)?;

    let mut drive = medium.take_drive()?;

    if let Err(err) = drive.write_blocks(plan.start_lba as u64, &session.bytes) {
        medium.wrote_well = Some(false);
        medium.attach_drive(drive);
        return Err(err);
    }

    if was_first {
        // Capture the session head now; later sessions re-write it at
        // LBA 0 so plain readers keep finding the image set.
        let mut head = vec![0u8; HEAD_SIZE];
        let take = session.bytes.len().min(HEAD_SIZE);
        head[..take].copy_from_slice(&session.bytes[..take]);
        medium.set_target_head(head);
    }

    medium.attach_drive(drive);
    if plan.emul_toc {
        medium.activate_session()?;
    }

    let written_blocks = (session.bytes.len() / BLOCK_SIZE) as u32;
    let end = plan.start_lba + written_blocks;
    if (opts.truncate || medium.truncate_enabled) && medium.role == SourceRole::RegularFile {
        let result = {
            let drive = medium.drive_mut()?;
            drive.truncate_to(end as u64)
        };
        if let Err(err) = result {
            // The old behavior silently ignored this.
            bus.submit_text(
                MSG_CODE,
                Severity::Warning,
                Channel::Info,
                format!("Cannot truncate output file to session end: {err}"),
            );
        }
    }

    medium.set_status_after_commit(align_up(end, NWA_ALIGNMENT));
    medium.append_emulated_session(plan.start_lba, session.session_blocks, Some(volid));
    medium.wrote_well = Some(true);

    image.tree.changes_pending = false;
    image.start_lba = Some(plan.start_lba);
    image.features.image_blocks = plan.start_lba + session.session_blocks;

    if !opts.reacquire {
        medium.release()?;
    }

    bus.submit_text(
        MSG_CODE,
        Severity::Update,
        Channel::Info,
        format!(
            "Session written at LBA {} with {} blocks",
            plan.start_lba, session.session_blocks
        ),
    );

    Ok(CommitOutcome {
        start_lba: plan.start_lba,
        session_blocks: session.session_blocks,
        written_blocks,
    })
}

struct SerializedSession {
    bytes: Vec<u8>,
    /// Session length in blocks before alignment padding.
    session_blocks: u32,
}

struct DirPlan {
    path: String,
    parent: usize,
    rel_extent: u32,
    data_len: u32,
}

struct ContentPlan {
    content: Arc<FileContent>,
    /// Extents in absolute blocks; `fresh` marks content that still has to
    /// be written into this session.
    extents: Vec<Extent>,
    fresh: bool,
}

/// Serializes one session: reserved head, volume descriptors, file data,
/// directory records, and both path tables. Files whose content already
/// lives in the image keep their extents and are not rewritten; only the
/// new directory tree references them.
struct SessionWriter;

impl SessionWriter {
    fn serialize(
        tree: &mut NodeTree,
        start_lba: u32,
        volume_id: &str,
        opts: &WriteOptions,
    ) -> Result<SerializedSession> {
        let mut dirs: Vec<DirPlan> = Vec::new();
        let mut contents: Vec<ContentPlan> = Vec::new();
        let mut content_index: HashMap<*const FileContent, usize> = HashMap::new();

        collect_dirs(&tree.root, "/", 0, &mut dirs);
        collect_contents(&tree.root, &mut contents, &mut content_index);

        // Directory sizes depend only on child names, so they can be
        // computed before any extent is placed.
        for plan in dirs.iter_mut() {
            let node = lookup(&tree.root, &plan.path);
            plan.data_len = directory_data_len(node);
        }

        // Layout: 16 reserved blocks, PVD, terminator, file data,
        // directories, path tables.
        let mut cursor: u32 = 18;
        for plan in contents.iter_mut().filter(|c| c.fresh) {
            plan.extents = split_extents(start_lba + cursor, plan.content.size);
            cursor += plan
                .extents
                .iter()
                .map(|e| e.blocks)
                .sum::<u32>();
        }
        for plan in dirs.iter_mut() {
            plan.rel_extent = cursor;
            cursor += plan.data_len / BLOCK_SIZE as u32;
        }

        let path_table = build_path_table(&dirs, start_lba);
        let table_blocks = (path_table.len() as u32).div_ceil(BLOCK_SIZE as u32);
        let l_table_rel = cursor;
        cursor += table_blocks;
        let m_table_rel = cursor;
        cursor += table_blocks;

        let session_blocks = cursor;
        let padding_blocks = (opts.padding_bytes as u32).div_ceil(BLOCK_SIZE as u32);
        let total_blocks = align_up(session_blocks + padding_blocks, NWA_ALIGNMENT);
        let mut bytes = vec![0u8; total_blocks as usize * BLOCK_SIZE];

        // Volume descriptors.
        let mut pvd = PrimaryVolumeDescriptor::new(volume_id, session_blocks);
        pvd.set_root_record(
            start_lba + dirs[0].rel_extent,
            dirs[0].data_len,
            tree.root.mtime,
        );
        pvd.set_path_tables(
            start_lba + l_table_rel,
            start_lba + m_table_rel,
            path_table.len() as u32,
        );
        put_block(&mut bytes, 16, bytemuck::bytes_of(&pvd));
        put_block(&mut bytes, 17, &terminator_block());

        // File data.
        for plan in contents.iter().filter(|c| c.fresh) {
            let data = load_content_bytes(&plan.content)?;
            let at = (plan.extents[0].start - start_lba) as usize * BLOCK_SIZE;
            bytes[at..at + data.len()].copy_from_slice(&data);
        }

        // Directory records.
        for (idx, plan) in dirs.iter().enumerate() {
            let node = lookup(&tree.root, &plan.path);
            let parent = &dirs[plan.parent];
            let records = directory_records(
                node,
                start_lba,
                plan,
                parent,
                &dirs,
                idx,
                &contents,
                &content_index,
            );
            let base = plan.rel_extent as usize * BLOCK_SIZE;
            bytes[base..base + records.len()].copy_from_slice(&records);
        }

        // Path tables, little endian then big endian.
        let base = l_table_rel as usize * BLOCK_SIZE;
        bytes[base..base + path_table.len()].copy_from_slice(&path_table);
        let m_table = build_path_table_be(&dirs, start_lba);
        let base = m_table_rel as usize * BLOCK_SIZE;
        bytes[base..base + m_table.len()].copy_from_slice(&m_table);

        // Re-point the tree at the freshly written extents, keeping
        // hard-link sharing intact.
        let mut replacements: HashMap<*const FileContent, Arc<FileContent>> = HashMap::new();
        for plan in contents.iter().filter(|c| c.fresh) {
            replacements.insert(
                Arc::as_ptr(&plan.content),
                FileContent::from_extents(plan.extents.clone()),
            );
        }
        tree.map_file_contents(|content| replacements.get(&Arc::as_ptr(content)).cloned());

        Ok(SerializedSession {
            bytes,
            session_blocks,
        })
    }
}

fn put_block(bytes: &mut [u8], rel_block: usize, data: &[u8]) {
    let at = rel_block * BLOCK_SIZE;
    bytes[at..at + data.len()].copy_from_slice(data);
}

fn lookup<'a>(root: &'a Node, path: &str) -> &'a Node {
    let mut cur = root;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        cur = cur.child(part).expect("directory plan paths stay valid");
    }
    cur
}

fn collect_dirs(node: &Node, path: &str, parent: usize, dirs: &mut Vec<DirPlan>) {
    let me = dirs.len();
    dirs.push(DirPlan {
        path: path.to_string(),
        parent,
        rel_extent: 0,
        data_len: 0,
    });
    if let Some(children) = node.children() {
        for child in children {
            if child.is_dir() {
                let child_path = if path == "/" {
                    format!("/{}", child.name)
                } else {
                    format!("{}/{}", path, child.name)
                };
                collect_dirs(child, &child_path, me, dirs);
            }
        }
    }
}

fn collect_contents(
    node: &Node,
    contents: &mut Vec<ContentPlan>,
    index: &mut HashMap<*const FileContent, usize>,
) {
    if let Some(content) = node.file_content() {
        let key = Arc::as_ptr(content);
        if !index.contains_key(&key) {
            let (extents, fresh) = match &content.source {
                ContentSource::Image(extents) => (extents.clone(), false),
                _ => (Vec::new(), true),
            };
            index.insert(key, contents.len());
            contents.push(ContentPlan {
                content: content.clone(),
                extents,
                fresh,
            });
        }
    }
    if let Some(children) = node.children() {
        for child in children {
            collect_contents(child, contents, index);
        }
    }
}

/// Encoded directory-record identifier of a node: files carry the ";1"
/// version suffix, directories do not.
fn encode_identifier(node: &Node) -> Vec<u8> {
    let mut name = node.name.as_bytes().to_vec();
    if !node.is_dir() {
        name.extend_from_slice(b";1");
    }
    name
}

/// Byte length of a directory's record data, block-padded. Records never
/// cross block boundaries.
fn directory_data_len(node: &Node) -> u32 {
    let mut blocks: u32 = 1;
    let mut used: usize = 34 + 34; // '\x00' and '\x01' records
    if let Some(children) = node.children() {
        for child in children {
            let extents = match child.file_content() {
                Some(content) => content_extent_count(content),
                None => 1,
            };
            let rec = DirectoryRecord::record_len(encode_identifier(child).len()) as usize;
            for _ in 0..extents {
                if used + rec > BLOCK_SIZE {
                    blocks += 1;
                    used = 0;
                }
                used += rec;
            }
        }
    }
    blocks * BLOCK_SIZE as u32
}

fn content_extent_count(content: &FileContent) -> usize {
    match &content.source {
        ContentSource::Image(extents) => extents.len().max(1),
        _ => split_extent_count(content.size),
    }
}

fn split_extent_count(size: u64) -> usize {
    if size == 0 {
        1
    } else {
        size.div_ceil(MAX_EXTENT_BYTES) as usize
    }
}

/// Splits a fresh content run into record-addressable extents.
fn split_extents(start: u32, size: u64) -> Vec<Extent> {
    if size == 0 {
        return vec![Extent {
            start,
            blocks: 0,
            tail: 2048,
        }];
    }
    let mut extents = Vec::new();
    let mut at = start;
    let mut left = size;
    while left > 0 {
        let take = left.min(MAX_EXTENT_BYTES);
        let extent = Extent::for_size(at, take);
        at += extent.blocks;
        left -= take;
        extents.push(extent);
    }
    extents
}

#[allow(clippy::too_many_arguments)]
fn directory_records(
    node: &Node,
    start_lba: u32,
    own: &DirPlan,
    parent: &DirPlan,
    dirs: &[DirPlan],
    self_idx: usize,
    contents: &[ContentPlan],
    content_index: &HashMap<*const FileContent, usize>,
) -> Vec<u8> {
    let self_extent = start_lba + own.rel_extent;
    let self_len = own.data_len;
    let parent_extent = start_lba + parent.rel_extent;
    let parent_len = parent.data_len;
    let mut out = Vec::with_capacity(self_len as usize);
    let emit = |record: DirectoryRecord, out: &mut Vec<u8>| {
        let bytes = record.to_bytes();
        let used = out.len() % BLOCK_SIZE;
        if used + bytes.len() > BLOCK_SIZE {
            out.resize(out.len() + BLOCK_SIZE - used, 0);
        }
        out.extend_from_slice(&bytes);
    };

    emit(
        DirectoryRecord::new(&[0x00], self_extent, self_len, FileFlags::DIRECTORY, node.mtime),
        &mut out,
    );
    emit(
        DirectoryRecord::new(
            &[0x01],
            parent_extent,
            parent_len,
            FileFlags::DIRECTORY,
            node.mtime,
        ),
        &mut out,
    );

    let mut subdir_cursor = 0usize;
    if let Some(children) = node.children() {
        for child in children {
            let name = encode_identifier(child);
            if child.is_dir() {
                // Subdirectories were collected in the same child order.
                let plan = dirs[self_idx + 1..]
                    .iter()
                    .filter(|d| d.parent == self_idx)
                    .nth(subdir_cursor)
                    .expect("subdirectory plan exists");
                subdir_cursor += 1;
                emit(
                    DirectoryRecord::new(
                        &name,
                        start_lba + plan.rel_extent,
                        plan.data_len,
                        FileFlags::DIRECTORY,
                        child.mtime,
                    ),
                    &mut out,
                );
            } else if let Some(content) = child.file_content() {
                let plan = &contents[content_index[&Arc::as_ptr(content)]];
                let extents = if plan.extents.is_empty() {
                    vec![Extent {
                        start: self_extent,
                        blocks: 0,
                        tail: 2048,
                    }]
                } else {
                    plan.extents.clone()
                };
                let last = extents.len() - 1;
                for (i, extent) in extents.iter().enumerate() {
                    let flags = if i == last {
                        FileFlags::empty()
                    } else {
                        FileFlags::NOT_FINAL
                    };
                    emit(
                        DirectoryRecord::new(
                            &name,
                            extent.start,
                            extent.byte_len() as u32,
                            flags,
                            child.mtime,
                        ),
                        &mut out,
                    );
                }
            } else {
                // Specials carry no extent in the plain ISO tree; they
                // are represented as empty files.
                emit(
                    DirectoryRecord::new(&name, self_extent, 0, FileFlags::empty(), child.mtime),
                    &mut out,
                );
            }
        }
    }
    out
}

fn load_content_bytes(content: &FileContent) -> Result<Vec<u8>> {
    match &content.source {
        ContentSource::Bytes(bytes) => Ok(bytes.clone()),
        ContentSource::Disk { path, offset, len } => {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = std::fs::File::open(path)?;
            file.seek(SeekFrom::Start(*offset))?;
            let mut data = vec![0u8; *len as usize];
            let mut done = 0;
            while done < data.len() {
                let n = file.read(&mut data[done..])?;
                if n == 0 {
                    break;
                }
                done += n;
            }
            // A file that shrank since planning keeps its recorded size,
            // zero filled.
            Ok(data)
        }
        ContentSource::Image(_) => Err(Error::AssertFailure(
            "image-resident content needs no rewrite",
        )),
    }
}

fn path_table_entries(dirs: &[DirPlan]) -> Vec<(Vec<u8>, u32, u16)> {
    dirs.iter()
        .enumerate()
        .map(|(i, plan)| {
            let name = if i == 0 {
                vec![0u8]
            } else {
                plan.path
                    .rsplit('/')
                    .next()
                    .unwrap_or("")
                    .as_bytes()
                    .to_vec()
            };
            (name, plan.rel_extent, (plan.parent + 1) as u16)
        })
        .collect()
}

fn build_path_table(dirs: &[DirPlan], start_lba: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, rel_extent, parent) in path_table_entries(dirs) {
        out.push(name.len() as u8);
        out.push(0);
        out.extend_from_slice(&(start_lba + rel_extent).to_le_bytes());
        out.extend_from_slice(&parent.to_le_bytes());
        out.extend_from_slice(&name);
        if name.len() % 2 == 1 {
            out.push(0);
        }
    }
    out
}

fn build_path_table_be(dirs: &[DirPlan], start_lba: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, rel_extent, parent) in path_table_entries(dirs) {
        out.push(name.len() as u8);
        out.push(0);
        out.extend_from_slice(&(start_lba + rel_extent).to_be_bytes());
        out.extend_from_slice(&parent.to_be_bytes());
        out.extend_from_slice(&name);
        if name.len() % 2 == 1 {
            out.push(0);
        }
    }
    out
}
