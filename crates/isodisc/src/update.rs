//! Disk/image comparison and reconciliation.
//!
//! The engine walks a disk subtree and an image subtree in lockstep and
//! classifies each node pair into a difference mask. In update mode the
//! mask drives a small action matrix: leave, overwrite, delete, add, or
//! adjust attributes only. Recorded device/inode pairs make hard-link
//! splits and fusions visible and allow skipping content comparison for
//! provably unchanged files.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use isodisc_msg::{Channel, MessageBus, Severity};
use md5::{Digest, Md5};

use crate::AbortFlag;
use crate::exclude::{ExcludeMatch, Exclusions};
use crate::loader::Image;
use crate::medium::MSG_CODE;
use crate::tree::{ContentSource, FileContent, Node, NodeKind};
use crate::{Error, Result};

/// Chunk size of content comparison and extraction.
const COMPARE_CHUNK: usize = 32 * 1024;

bitflags::bitflags! {
    /// What differs between a disk node and an image node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DiffMask: u32 {
        const MISSING_ON_DISK = 1 << 0;
        const MISSING_IN_IMAGE = 1 << 1;
        const MODE = 1 << 2;
        const TYPE = 1 << 3;
        const UID = 1 << 4;
        const GID = 1 << 5;
        const RDEV = 1 << 6;
        const SIZE = 1 << 7;
        const MTIME = 1 << 8;
        const ATIME = 1 << 9;
        const CTIME = 1 << 10;
        const DISK_OPEN_FAILED = 1 << 11;
        const IMAGE_OPEN_FAILED = 1 << 12;
        const DISK_EOF_EARLY = 1 << 13;
        const IMAGE_EOF_EARLY = 1 << 14;
        const CONTENT = 1 << 15;
        /// Symlink on disk points to a directory while the image node is
        /// a directory.
        const SYMLINK_TO_DIR = 1 << 16;
        /// The image side is a collection of split chunks.
        const SPLIT_CHUNKS = 1 << 17;
        const SPLIT_INCOMPLETE = 1 << 18;
        const ACL = 1 << 19;
        const XATTR = 1 << 20;
        const DEV_INO_MISMATCH = 1 << 21;
        const DEV_INO_MISSING = 1 << 22;
        const IMAGE_NEWER_THAN_EPOCH = 1 << 23;
        const HARDLINK_SPLIT = 1 << 24;
        const HARDLINK_FUSION = 1 << 25;
    }
}

impl DiffMask {
    /// Bits that report circumstances rather than differences.
    const INFORMATIONAL: DiffMask = DiffMask::SPLIT_CHUNKS
        .union(DiffMask::SPLIT_INCOMPLETE)
        .union(DiffMask::DEV_INO_MISSING)
        .union(DiffMask::IMAGE_NEWER_THAN_EPOCH)
        .union(DiffMask::HARDLINK_SPLIT)
        .union(DiffMask::HARDLINK_FUSION);

    /// Whether the node pair matches, ignoring informational bits.
    pub fn is_clean(&self) -> bool {
        (*self - Self::INFORMATIONAL).is_empty()
    }
}

/// Comparison behavior. Every switch is a named field.
#[derive(Debug, Clone)]
pub struct CompareOptions {
    pub compare_atime: bool,
    pub compare_ctime: bool,
    /// Follow symbolic links on the disk side.
    pub follow_links: bool,
    /// Trust a recorded MD5 instead of reading image content.
    pub md5_quick: bool,
    /// Skip content comparison when recorded dev/ino matches and the
    /// timestamps allow it.
    pub dev_ino_shortcut: bool,
    /// Reference time of the loaded session; image nodes younger than
    /// this cannot be trusted by the shortcut.
    pub epoch: Option<i64>,
    /// Do not delete image nodes missing on disk; mark them instead.
    pub merge: bool,
    pub link_hop_limit: u32,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            compare_atime: false,
            compare_ctime: false,
            follow_links: false,
            md5_quick: false,
            dev_ino_shortcut: true,
            epoch: None,
            merge: false,
            link_hop_limit: 100,
        }
    }
}

/// What the reconciliation did to one node pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Nothing,
    Added,
    Overwritten,
    Deleted,
    ReAdded,
    AttrsAdjusted,
    /// Problems were reported; the image node was left unchanged.
    Reported,
    /// Marked for the merge bookkeeping only.
    Marked,
}

#[derive(Debug, Default)]
pub struct UpdateSummary {
    pub compared: usize,
    /// Actions other than `Nothing`, in walk order, with the final
    /// difference mask of the pair.
    pub actions: Vec<(String, UpdateAction, DiffMask)>,
    /// Highest-severity trouble seen: false once anything failed.
    pub clean: bool,
}

/// One part of a split file: a numbered chunk of a large file represented
/// as a directory of parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPart {
    pub partno: u32,
    pub total_parts: u32,
    pub offset: u64,
    pub bytes: u64,
    pub total_bytes: u64,
}

pub fn compose_split_name(part: &SplitPart) -> String {
    format!(
        "part_{}_of_{}_at_{}_with_{}_of_{}",
        part.partno, part.total_parts, part.offset, part.bytes, part.total_bytes
    )
}

pub fn parse_split_name(name: &str) -> Option<SplitPart> {
    let rest = name.strip_prefix("part_")?;
    let (partno, rest) = rest.split_once("_of_")?;
    let (total_parts, rest) = rest.split_once("_at_")?;
    let (offset, rest) = rest.split_once("_with_")?;
    let (bytes, total_bytes) = rest.split_once("_of_")?;
    Some(SplitPart {
        partno: partno.parse().ok()?,
        total_parts: total_parts.parse().ok()?,
        offset: offset.parse().ok()?,
        bytes: bytes.parse().ok()?,
        total_bytes: total_bytes.parse().ok()?,
    })
}

#[derive(Clone)]
enum KindSnap {
    File,
    Dir,
    Symlink(String),
    Device { block: bool, major: u32, minor: u32 },
    Fifo,
    Socket,
    Boot,
}

/// Borrow-free snapshot of an image node, taken before the engine starts
/// mutating the tree.
#[derive(Clone)]
struct NodeSnap {
    kind: KindSnap,
    content: Option<Arc<FileContent>>,
    md5: Option<[u8; 16]>,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
    atime: i64,
    ctime: i64,
    acl: Option<String>,
    xattr: BTreeMap<String, Vec<u8>>,
    recorded: Option<(u64, u64)>,
    size: u64,
    split: Option<Vec<(SplitPart, Arc<FileContent>)>>,
}

fn snapshot(node: &Node) -> NodeSnap {
    let (kind, content, size) = match &node.kind {
        NodeKind::File(content) => (KindSnap::File, Some(content.clone()), content.size),
        NodeKind::Directory(_) => (KindSnap::Dir, None, 0),
        NodeKind::Symlink(target) => (KindSnap::Symlink(target.clone()), None, 0),
        NodeKind::Device {
            block,
            major,
            minor,
        } => (
            KindSnap::Device {
                block: *block,
                major: *major,
                minor: *minor,
            },
            None,
            0,
        ),
        NodeKind::Fifo => (KindSnap::Fifo, None, 0),
        NodeKind::Socket => (KindSnap::Socket, None, 0),
        NodeKind::BootPlaceholder => (KindSnap::Boot, None, 0),
    };
    let split = match &node.kind {
        NodeKind::Directory(children) if !children.is_empty() => {
            let mut parts = Vec::new();
            let mut all = true;
            for child in children {
                match (parse_split_name(&child.name), child.file_content()) {
                    (Some(part), Some(content)) => parts.push((part, content.clone())),
                    _ => {
                        all = false;
                        break;
                    }
                }
            }
            if all {
                parts.sort_by_key(|(p, _)| p.offset);
                Some(parts)
            } else {
                None
            }
        }
        _ => None,
    };
    NodeSnap {
        kind,
        content,
        md5: node.md5,
        mode: node.mode,
        uid: node.uid,
        gid: node.gid,
        mtime: node.mtime,
        atime: node.atime,
        ctime: node.ctime,
        acl: node.acl.clone(),
        xattr: node.xattr.clone(),
        recorded: node.recorded,
        size,
        split,
    }
}

#[cfg(unix)]
fn disk_kind(meta: &std::fs::Metadata) -> KindSnap {
    use std::os::unix::fs::FileTypeExt;
    let ft = meta.file_type();
    if ft.is_dir() {
        KindSnap::Dir
    } else if ft.is_symlink() {
        KindSnap::Symlink(String::new())
    } else if ft.is_block_device() {
        KindSnap::Device {
            block: true,
            major: 0,
            minor: 0,
        }
    } else if ft.is_char_device() {
        KindSnap::Device {
            block: false,
            major: 0,
            minor: 0,
        }
    } else if ft.is_fifo() {
        KindSnap::Fifo
    } else if ft.is_socket() {
        KindSnap::Socket
    } else {
        KindSnap::File
    }
}

fn kind_name(kind: &KindSnap) -> &'static str {
    match kind {
        KindSnap::File => "-",
        KindSnap::Dir => "d",
        KindSnap::Symlink(_) => "l",
        KindSnap::Device { block: true, .. } => "b",
        KindSnap::Device { block: false, .. } => "c",
        KindSnap::Fifo => "p",
        KindSnap::Socket => "s",
        KindSnap::Boot => "e",
    }
}

fn same_kind(a: &KindSnap, b: &KindSnap) -> bool {
    matches!(
        (a, b),
        (KindSnap::File, KindSnap::File)
            | (KindSnap::Dir, KindSnap::Dir)
            | (KindSnap::Symlink(_), KindSnap::Symlink(_))
            | (
                KindSnap::Device { block: true, .. },
                KindSnap::Device { block: true, .. }
            )
            | (
                KindSnap::Device { block: false, .. },
                KindSnap::Device { block: false, .. }
            )
            | (KindSnap::Fifo, KindSnap::Fifo)
            | (KindSnap::Socket, KindSnap::Socket)
    )
}

#[cfg(unix)]
fn rdev_major(rdev: u64) -> u32 {
    (((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfffu64)) as u32
}

#[cfg(unix)]
fn rdev_minor(rdev: u64) -> u32 {
    ((rdev & 0xff) | ((rdev >> 12) & !0xffu64)) as u32
}

/// Pluggable reader for disk-side ACL and xattr text. The conversion of
/// host attributes is an adapter concern; the default reads nothing.
pub trait DiskAttrReader {
    fn acl(&self, _path: &Path) -> Option<String> {
        None
    }
    fn xattr(&self, _path: &Path) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::new()
    }
}

/// Default attribute reader: external attributes are ignored.
#[derive(Debug, Default)]
pub struct NoDiskAttrs;

impl DiskAttrReader for NoDiskAttrs {}

/// The reconciliation engine over one loaded image.
pub struct UpdateEngine<'a> {
    image: &'a mut Image,
    exclusions: &'a Exclusions,
    opts: CompareOptions,
    bus: Arc<MessageBus>,
    abort: AbortFlag,
    attr_reader: Box<dyn DiskAttrReader>,
    link_stack: Vec<(u64, u64)>,
    /// Inodes whose image content was refreshed in this run; later links
    /// of the same inode fuse to these, never to stale siblings.
    updated_inodes: std::collections::HashMap<(u64, u64), String>,
    /// Paths marked by update-merge runs: visited, and whether found.
    pub merge_marks: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Compare,
    Update,
}

impl<'a> UpdateEngine<'a> {
    pub fn new(
        image: &'a mut Image,
        exclusions: &'a Exclusions,
        opts: CompareOptions,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            image,
            exclusions,
            opts,
            bus,
            abort: AbortFlag::new(),
            attr_reader: Box::new(NoDiskAttrs),
            link_stack: Vec::new(),
            updated_inodes: std::collections::HashMap::new(),
            merge_marks: HashSet::new(),
        }
    }

    pub fn with_abort(mut self, abort: AbortFlag) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_attr_reader(mut self, reader: Box<dyn DiskAttrReader>) -> Self {
        self.attr_reader = reader;
        self
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort.is_requested() {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    fn result_line(&self, text: String) {
        self.bus
            .submit_text(MSG_CODE, Severity::Note, Channel::Result, text);
    }

    fn info(&self, severity: Severity, text: String) {
        self.bus.submit_text(MSG_CODE, severity, Channel::Info, text);
    }

    /// Compares disk and image subtrees, reporting every difference on the
    /// result channel. Returns the summary without touching the image.
    pub fn compare_tree(&mut self, disk_root: &Path, iso_root: &str) -> Result<UpdateSummary> {
        let mut summary = UpdateSummary {
            clean: true,
            ..Default::default()
        };
        self.walk_pair(disk_root, iso_root, Mode::Compare, &mut summary)?;
        Ok(summary)
    }

    /// Updates the image subtree from the disk subtree.
    pub fn update_tree(&mut self, disk_root: &Path, iso_root: &str) -> Result<UpdateSummary> {
        let mut summary = UpdateSummary {
            clean: true,
            ..Default::default()
        };
        self.image.tree.mkdir_all(iso_root)?;
        self.walk_pair(disk_root, iso_root, Mode::Update, &mut summary)?;
        if !summary.actions.is_empty() {
            self.image.tree.changes_pending = true;
        }
        Ok(summary)
    }

    fn walk_pair(
        &mut self,
        disk_dir: &Path,
        iso_dir: &str,
        mode: Mode,
        summary: &mut UpdateSummary,
    ) -> Result<()> {
        self.check_abort()?;

        let mut names: Vec<String> = Vec::new();
        match std::fs::read_dir(disk_dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if let Ok(name) = entry.file_name().into_string() {
                        names.push(name);
                    }
                }
            }
            Err(err) => {
                self.info(
                    Severity::Failure,
                    format!("Cannot open disk directory {}: {err}", disk_dir.display()),
                );
                summary.clean = false;
                return Ok(());
            }
        }
        if let Ok(node) = self.image.tree.lookup(iso_dir) {
            if let Some(children) = node.children() {
                for child in children {
                    if !names.contains(&child.name) {
                        names.push(child.name.clone());
                    }
                }
            }
        }
        names.sort();

        for name in names {
            self.check_abort()?;
            let disk_path = disk_dir.join(&name);
            let iso_path = if iso_dir == "/" {
                format!("/{name}")
            } else {
                format!("{iso_dir}/{name}")
            };

            if self.exclusions.matches(&disk_path) != ExcludeMatch::No {
                self.result_line(format!(
                    "? {} (DISK) : excluded by exclusion rule",
                    disk_path.display()
                ));
                continue;
            }

            summary.compared += 1;
            let mask = self.compare_node(&disk_path, &iso_path, mode == Mode::Update)?;

            let action = match mode {
                Mode::Compare => {
                    if !mask.is_clean() {
                        summary.clean = false;
                    }
                    UpdateAction::Nothing
                }
                Mode::Update => {
                    let (action, final_mask) = self.update_node(&disk_path, &iso_path, mask)?;
                    if action != UpdateAction::Nothing && action != UpdateAction::Marked {
                        summary.actions.push((iso_path.clone(), action, final_mask));
                    }
                    action
                }
            };

            // Recurse where both sides stay directories.
            if mask.contains(DiffMask::SPLIT_CHUNKS) {
                continue;
            }
            if action == UpdateAction::Deleted {
                continue;
            }
            let disk_meta = if self.opts.follow_links {
                std::fs::metadata(&disk_path)
            } else {
                std::fs::symlink_metadata(&disk_path)
            };
            let Ok(disk_meta) = disk_meta else { continue };
            if !disk_meta.is_dir() {
                continue;
            }
            let image_is_dir = self
                .image
                .tree
                .lookup(&iso_path)
                .map(|n| n.is_dir())
                .unwrap_or(false);
            if !image_is_dir {
                continue;
            }

            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                let key = (disk_meta.dev(), disk_meta.ino());
                if self.link_stack.contains(&key) {
                    self.info(
                        Severity::Warning,
                        format!(
                            "Detected directory cycle at {}; not following",
                            disk_path.display()
                        ),
                    );
                    continue;
                }
                if self.link_stack.len() >= self.opts.link_hop_limit as usize {
                    return Err(Error::TooManyLinkHops(self.opts.link_hop_limit));
                }
                self.link_stack.push(key);
                let result = self.walk_pair(&disk_path, &iso_path, mode, summary);
                self.link_stack.pop();
                result?;
            }
            #[cfg(not(unix))]
            {
                self.walk_pair(&disk_path, &iso_path, mode, summary)?;
            }
        }
        Ok(())
    }

    /// Classifies one disk/image node pair into a difference mask,
    /// emitting one result line per difference unless `quiet`.
    pub fn compare_node(
        &mut self,
        disk_path: &Path,
        iso_path: &str,
        quiet: bool,
    ) -> Result<DiffMask> {
        let mut mask = DiffMask::empty();

        let disk_meta = if self.opts.follow_links {
            std::fs::metadata(disk_path)
        } else {
            std::fs::symlink_metadata(disk_path)
        };
        let disk_meta = match disk_meta {
            Ok(meta) => Some(meta),
            Err(_) => {
                if !quiet {
                    self.result_line(format!(
                        "? {} (DISK) : cannot lstat()",
                        disk_path.display()
                    ));
                }
                mask |= DiffMask::MISSING_ON_DISK;
                None
            }
        };

        let snap = match self.image.tree.lookup(iso_path) {
            Ok(node) => Some(snapshot(node)),
            Err(_) => {
                if !quiet {
                    self.result_line(format!(
                        "? {iso_path} (ISO) : cannot find this file in ISO image"
                    ));
                }
                mask |= DiffMask::MISSING_IN_IMAGE;
                None
            }
        };

        let (Some(disk_meta), Some(snap)) = (disk_meta, snap) else {
            return Ok(mask);
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let dk = disk_kind(&disk_meta);
            let label = format!("{} {}", kind_name(&dk), disk_path.display());

            // A regular or block file facing a directory of split chunks
            // is compared against the reassembled parts.
            let is_split = matches!(dk, KindSnap::File | KindSnap::Device { block: true, .. })
                && matches!(snap.kind, KindSnap::Dir)
                && snap.split.is_some();
            if is_split {
                mask |= DiffMask::SPLIT_CHUNKS;
            }

            let disk_mode = disk_meta.mode() & 0o7777;
            if disk_mode != snap.mode {
                mask |= DiffMask::MODE;
                if !quiet {
                    self.result_line(format!(
                        "{label} : st_mode : {disk_mode:o} <> {:o}",
                        snap.mode
                    ));
                }
            }
            if !is_split && !same_kind(&dk, &snap.kind) {
                mask |= DiffMask::TYPE;
                if !quiet {
                    self.result_line(format!(
                        "{label} : type : {} <> {}",
                        kind_name(&dk),
                        kind_name(&snap.kind)
                    ));
                }
                if matches!(dk, KindSnap::Symlink(_)) && matches!(snap.kind, KindSnap::Dir) {
                    if let Ok(target_meta) = std::fs::metadata(disk_path) {
                        if target_meta.is_dir() {
                            mask |= DiffMask::SYMLINK_TO_DIR;
                        }
                    }
                }
            }
            if disk_meta.uid() != snap.uid {
                mask |= DiffMask::UID;
                if !quiet {
                    self.result_line(format!(
                        "{label} : st_uid : {} <> {}",
                        disk_meta.uid(),
                        snap.uid
                    ));
                }
            }
            if disk_meta.gid() != snap.gid {
                mask |= DiffMask::GID;
                if !quiet {
                    self.result_line(format!(
                        "{label} : st_gid : {} <> {}",
                        disk_meta.gid(),
                        snap.gid
                    ));
                }
            }
            if let (
                KindSnap::Device { .. },
                KindSnap::Device {
                    major,
                    minor,
                    ..
                },
            ) = (&dk, &snap.kind)
            {
                let dmajor = rdev_major(disk_meta.rdev());
                let dminor = rdev_minor(disk_meta.rdev());
                if dmajor != *major || dminor != *minor {
                    mask |= DiffMask::RDEV;
                    if !quiet {
                        self.result_line(format!(
                            "{label} : st_rdev : {dmajor},{dminor} <> {major},{minor}"
                        ));
                    }
                }
            }

            let both_files = matches!(dk, KindSnap::File) && matches!(snap.kind, KindSnap::File);
            if both_files && disk_meta.size() != snap.size {
                mask |= DiffMask::SIZE;
                if !quiet {
                    self.result_line(format!(
                        "{label} : st_size : {} <> {}",
                        disk_meta.size(),
                        snap.size
                    ));
                }
            }
            if disk_meta.mtime() != snap.mtime {
                mask |= DiffMask::MTIME;
                if !quiet {
                    self.result_line(format!(
                        "{label} : st_mtime : {} <> {}",
                        disk_meta.mtime(),
                        snap.mtime
                    ));
                }
            }
            if self.opts.compare_atime && disk_meta.atime() != snap.atime {
                mask |= DiffMask::ATIME;
                if !quiet {
                    self.result_line(format!(
                        "{label} : st_atime : {} <> {}",
                        disk_meta.atime(),
                        snap.atime
                    ));
                }
            }
            if self.opts.compare_ctime && disk_meta.ctime() != snap.ctime {
                mask |= DiffMask::CTIME;
                if !quiet {
                    self.result_line(format!(
                        "{label} : st_ctime : {} <> {}",
                        disk_meta.ctime(),
                        snap.ctime
                    ));
                }
            }
            if let Some(epoch) = self.opts.epoch {
                if epoch > 0
                    && (snap.mtime >= epoch
                        || (self.opts.compare_atime && snap.atime >= epoch)
                        || (self.opts.compare_ctime && snap.ctime >= epoch))
                {
                    mask |= DiffMask::IMAGE_NEWER_THAN_EPOCH;
                }
            }

            // ACL and xattr, as far as the attribute reader can see.
            let disk_acl = self.attr_reader.acl(disk_path);
            if disk_acl != snap.acl {
                mask |= DiffMask::MODE | DiffMask::ACL;
                if !quiet {
                    self.result_line(format!("{label} : ACL : differs"));
                }
            }
            let disk_xattr = self.attr_reader.xattr(disk_path);
            if disk_xattr != snap.xattr {
                mask |= DiffMask::XATTR;
                if !quiet {
                    self.result_line(format!("{label} : xattr : differs"));
                }
            }

            // Recorded dev/ino: hard-link tracking and the content
            // shortcut.
            let disk_key = (disk_meta.dev(), disk_meta.ino());
            let mut content_shortcut = false;
            match snap.recorded {
                Some(recorded) if recorded == disk_key => {
                    if self.opts.dev_ino_shortcut && both_files {
                        let attr_bits = DiffMask::TYPE
                            | DiffMask::SIZE
                            | DiffMask::MTIME
                            | DiffMask::ATIME
                            | DiffMask::CTIME
                            | DiffMask::IMAGE_NEWER_THAN_EPOCH;
                        if mask.intersects(attr_bits) {
                            mask |= DiffMask::CONTENT;
                            if !quiet {
                                self.result_line(format!(
                                    "{label} : content : assuming inequality due to size or timestamps"
                                ));
                            }
                        }
                        content_shortcut = true;
                    }
                }
                Some(_) => {
                    mask |= DiffMask::DEV_INO_MISMATCH;
                    if !quiet {
                        self.result_line(format!("{label} : dev_ino : differing"));
                    }
                    if self.opts.dev_ino_shortcut && both_files {
                        mask |= DiffMask::CONTENT;
                        content_shortcut = true;
                        if !quiet {
                            self.result_line(format!(
                                "{label} : content : assuming inequality after dev_ino mismatch"
                            ));
                        }
                    }
                }
                None => {
                    mask |= DiffMask::DEV_INO_MISSING;
                }
            }

            // Content, by bytes or recorded MD5.
            if both_files && !content_shortcut {
                self.compare_file_content(
                    disk_path,
                    disk_meta.size(),
                    &snap,
                    &label,
                    quiet,
                    &mut mask,
                )?;
            } else if is_split {
                let parts = snap.split.as_ref().unwrap();
                let total_parts = parts.first().map(|(p, _)| p.total_parts).unwrap_or(0);
                for (part, content) in parts {
                    self.compare_range(
                        disk_path,
                        part.offset,
                        part.bytes.min(disk_meta.size().saturating_sub(part.offset)),
                        content,
                        &label,
                        quiet,
                        &mut mask,
                    )?;
                }
                if total_parts as usize != parts.len() {
                    mask |= DiffMask::SPLIT_INCOMPLETE;
                    if !quiet {
                        self.info(
                            Severity::Note,
                            format!(
                                "- {iso_path}/* (ISO) : Not all split parts present ({} of {})",
                                parts.len(),
                                total_parts
                            ),
                        );
                    }
                }
                if disk_meta.size() != parts.first().map(|(p, _)| p.total_bytes).unwrap_or(0) {
                    mask |= DiffMask::SIZE;
                }
            }
        }

        Ok(mask)
    }

    fn compare_file_content(
        &mut self,
        disk_path: &Path,
        disk_size: u64,
        snap: &NodeSnap,
        label: &str,
        quiet: bool,
        mask: &mut DiffMask,
    ) -> Result<()> {
        if self.opts.md5_quick {
            if let Some(recorded) = snap.md5 {
                match md5_of_file(disk_path, &self.abort) {
                    Ok(digest) => {
                        if digest != recorded {
                            *mask |= DiffMask::CONTENT;
                            if !quiet {
                                self.result_line(format!("{label} : content : MD5 differs"));
                            }
                        }
                        return Ok(());
                    }
                    Err(Error::Aborted) => return Err(Error::Aborted),
                    Err(_) => {
                        *mask |= DiffMask::DISK_OPEN_FAILED;
                        return Ok(());
                    }
                }
            }
        }
        let content = snap.content.clone().expect("file snapshot carries content");
        self.compare_range(disk_path, 0, disk_size, &content, label, quiet, mask)
    }

    /// Compares one disk byte range against one image content record, in
    /// 32 KiB chunks.
    #[allow(clippy::too_many_arguments)]
    fn compare_range(
        &mut self,
        disk_path: &Path,
        disk_offset: u64,
        range_len: u64,
        content: &Arc<FileContent>,
        label: &str,
        quiet: bool,
        mask: &mut DiffMask,
    ) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = match std::fs::File::open(disk_path) {
            Ok(file) => file,
            Err(_) => {
                *mask |= DiffMask::DISK_OPEN_FAILED;
                if !quiet {
                    self.result_line(format!("{label} : cannot open disk file"));
                }
                return Ok(());
            }
        };
        if file.seek(SeekFrom::Start(disk_offset)).is_err() {
            *mask |= DiffMask::DISK_OPEN_FAILED;
            return Ok(());
        }

        let total = range_len.max(content.size);
        let mut disk_buf = vec![0u8; COMPARE_CHUNK];
        let mut image_buf = vec![0u8; COMPARE_CHUNK];
        let mut pos: u64 = 0;
        while pos < total {
            self.check_abort()?;
            let want = COMPARE_CHUNK.min((total - pos) as usize);
            let disk_want = if pos >= range_len {
                0
            } else {
                want.min((range_len - pos) as usize)
            };

            let mut disk_n = 0;
            while disk_n < disk_want {
                match file.read(&mut disk_buf[disk_n..disk_want]) {
                    Ok(0) => break,
                    Ok(n) => disk_n += n,
                    Err(_) => {
                        *mask |= DiffMask::DISK_OPEN_FAILED;
                        return Ok(());
                    }
                }
            }

            let image_n = match self
                .image
                .read_content_range(content, pos, &mut image_buf[..want])
            {
                Ok(n) => n,
                Err(_) => {
                    *mask |= DiffMask::IMAGE_OPEN_FAILED;
                    if !quiet {
                        self.result_line(format!("{label} : cannot read ISO file content"));
                    }
                    return Ok(());
                }
            };

            if disk_n == 0 && image_n == 0 {
                break;
            }
            let common = disk_n.min(image_n);
            if disk_buf[..common] != image_buf[..common] {
                *mask |= DiffMask::CONTENT;
                if !quiet {
                    self.result_line(format!(
                        "{label} : content : differs within bytes {} ..",
                        disk_offset + pos
                    ));
                }
                return Ok(());
            }
            if disk_n < image_n {
                *mask |= DiffMask::DISK_EOF_EARLY | DiffMask::CONTENT;
                if !quiet {
                    self.result_line(format!("{label} : early EOF of disk file"));
                }
                return Ok(());
            }
            if image_n < disk_n {
                *mask |= DiffMask::IMAGE_EOF_EARLY | DiffMask::CONTENT;
                if !quiet {
                    self.result_line(format!("{label} : early EOF of ISO file"));
                }
                return Ok(());
            }
            pos += common as u64;
        }
        Ok(())
    }

    /// Applies the reconciliation matrix to one compared node pair.
    /// Returns the action taken and the mask, augmented with any
    /// hard-link split/fusion bits discovered along the way.
    pub fn update_node(
        &mut self,
        disk_path: &Path,
        iso_path: &str,
        mut mask: DiffMask,
    ) -> Result<(UpdateAction, DiffMask)> {
        if mask.contains(DiffMask::MISSING_ON_DISK | DiffMask::MISSING_IN_IMAGE) {
            self.info(
                Severity::Sorry,
                format!("Missing on disk and in ISO: {}", disk_path.display()),
            );
            return Ok((UpdateAction::Nothing, mask));
        }

        if self.opts.merge && !mask.contains(DiffMask::MISSING_IN_IMAGE) {
            self.merge_marks.insert(iso_path.to_string());
        }

        if mask.is_empty() {
            return Ok((UpdateAction::Nothing, mask));
        }

        if mask.intersects(DiffMask::DISK_OPEN_FAILED | DiffMask::DISK_EOF_EARLY) {
            self.info(
                Severity::Failure,
                format!("Problems with reading disk file {}", disk_path.display()),
            );
            return Ok((UpdateAction::Reported, mask));
        }

        // Hard-link bookkeeping: a fresh file may join an existing family,
        // a changed inode may leave one.
        if mask.contains(DiffMask::DEV_INO_MISMATCH) {
            self.note_hardlink_split(iso_path, disk_path, &mut mask)?;
        }

        let action = if mask.intersects(DiffMask::TYPE | DiffMask::RDEV) {
            self.image.tree.remove(iso_path, true)?;
            self.graft_from_disk(disk_path, iso_path)?;
            self.info(Severity::Update, format!("Deleted and re-added {iso_path}"));
            UpdateAction::ReAdded
        } else if mask.contains(DiffMask::MISSING_ON_DISK) {
            if self.opts.merge {
                UpdateAction::Marked
            } else {
                self.image.tree.remove(iso_path, true)?;
                self.info(Severity::Update, format!("Deleted {iso_path}"));
                UpdateAction::Deleted
            }
        } else if mask.intersects(
            DiffMask::MISSING_IN_IMAGE
                | DiffMask::SIZE
                | DiffMask::IMAGE_OPEN_FAILED
                | DiffMask::IMAGE_EOF_EARLY
                | DiffMask::CONTENT,
        ) {
            let added = mask.contains(DiffMask::MISSING_IN_IMAGE);
            if mask.contains(DiffMask::SPLIT_CHUNKS) {
                self.overwrite_split(disk_path, iso_path)?;
            } else {
                if !added {
                    self.image.tree.remove(iso_path, true)?;
                }
                self.graft_from_disk(disk_path, iso_path)?;
                self.fuse_hardlinks(disk_path, iso_path, added, &mut mask)?;
            }
            self.info(Severity::Update, format!("Added/overwrote {iso_path}"));
            if added {
                UpdateAction::Added
            } else {
                UpdateAction::Overwritten
            }
        } else if mask.intersects(
            DiffMask::MODE
                | DiffMask::UID
                | DiffMask::GID
                | DiffMask::MTIME
                | DiffMask::ATIME
                | DiffMask::CTIME
                | DiffMask::ACL
                | DiffMask::XATTR
                | DiffMask::DEV_INO_MISSING,
        ) {
            self.copy_attributes(disk_path, iso_path, !mask.contains(DiffMask::DEV_INO_MISMATCH))?;
            self.info(Severity::Update, format!("Adjusted attributes of {iso_path}"));
            UpdateAction::AttrsAdjusted
        } else {
            UpdateAction::Nothing
        };

        Ok((action, mask))
    }

    /// Builds an image node from the disk node and inserts it.
    fn graft_from_disk(&mut self, disk_path: &Path, iso_path: &str) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let meta = if self.opts.follow_links {
                std::fs::metadata(disk_path)?
            } else {
                std::fs::symlink_metadata(disk_path)?
            };
            let name = disk_path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::BadValue(format!("unusable name: {}", disk_path.display())))?;

            let kind = if meta.is_dir() {
                NodeKind::Directory(Vec::new())
            } else if meta.file_type().is_symlink() {
                let target = std::fs::read_link(disk_path)?;
                NodeKind::Symlink(target.to_string_lossy().into_owned())
            } else if meta.is_file() {
                NodeKind::File(FileContent::from_disk(
                    disk_path.to_path_buf(),
                    0,
                    meta.size(),
                ))
            } else {
                use std::os::unix::fs::FileTypeExt;
                let ft = meta.file_type();
                if ft.is_block_device() || ft.is_char_device() {
                    NodeKind::Device {
                        block: ft.is_block_device(),
                        major: rdev_major(meta.rdev()),
                        minor: rdev_minor(meta.rdev()),
                    }
                } else if ft.is_fifo() {
                    NodeKind::Fifo
                } else {
                    NodeKind::Socket
                }
            };

            let mut node = Node::new(name, kind);
            node.mode = meta.mode() & 0o7777;
            node.uid = meta.uid();
            node.gid = meta.gid();
            node.mtime = meta.mtime();
            node.atime = meta.atime();
            node.ctime = meta.ctime();
            node.recorded = Some((meta.dev(), meta.ino()));
            node.acl = self.attr_reader.acl(disk_path);
            node.xattr = self.attr_reader.xattr(disk_path);

            let parent = match iso_path.rsplit_once('/') {
                Some(("", _)) | None => "/".to_string(),
                Some((parent, _)) => parent.to_string(),
            };
            self.image.tree.mkdir_all(&parent)?;
            self.image.tree.add_child(&parent, node)?;
        }
        Ok(())
    }

    /// Re-adds a split-file collection from a changed disk file.
    fn overwrite_split(&mut self, disk_path: &Path, iso_path: &str) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let snap = snapshot(self.image.tree.lookup(iso_path)?);
            let parts = snap
                .split
                .ok_or(Error::AssertFailure("split overwrite without split parts"))?;
            let meta = std::fs::symlink_metadata(disk_path)?;
            let disk_size = meta.size();
            let first_bytes = parts.first().map(|(p, _)| p.bytes).unwrap_or(disk_size.max(1));
            let new_total = disk_size.div_ceil(first_bytes.max(1)).max(1) as u32;

            // Drop the old parts, keep the enclosing directory.
            let old_names: Vec<String> = parts
                .iter()
                .map(|(p, _)| compose_split_name(p))
                .collect();
            for name in old_names {
                let part_path = format!("{iso_path}/{name}");
                self.image.tree.remove(&part_path, true)?;
            }
            for partno in 1..=new_total {
                let offset = (partno as u64 - 1) * first_bytes;
                if offset >= disk_size && disk_size > 0 {
                    break;
                }
                let bytes = first_bytes.min(disk_size - offset);
                let part = SplitPart {
                    partno,
                    total_parts: new_total,
                    offset,
                    bytes: first_bytes,
                    total_bytes: disk_size,
                };
                let mut node = Node::new_file(
                    &compose_split_name(&part),
                    FileContent::from_disk(disk_path.to_path_buf(), offset, bytes),
                );
                node.mode = meta.mode() & 0o7777;
                node.mtime = meta.mtime();
                self.image.tree.add_child(iso_path, node)?;
            }
            self.copy_attributes(disk_path, iso_path, true)?;
        }
        Ok(())
    }

    fn copy_attributes(
        &mut self,
        disk_path: &Path,
        iso_path: &str,
        include_dev_ino: bool,
    ) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let meta = if self.opts.follow_links {
                std::fs::metadata(disk_path)?
            } else {
                std::fs::symlink_metadata(disk_path)?
            };
            let acl = self.attr_reader.acl(disk_path);
            let xattr = self.attr_reader.xattr(disk_path);
            let node = self.image.tree.lookup_mut(iso_path)?;
            node.mode = meta.mode() & 0o7777;
            node.uid = meta.uid();
            node.gid = meta.gid();
            node.mtime = meta.mtime();
            node.atime = meta.atime();
            node.ctime = meta.ctime();
            node.acl = acl;
            node.xattr = xattr;
            if include_dev_ino {
                node.recorded = Some((meta.dev(), meta.ino()));
            }
            self.image.tree.changes_pending = true;
        }
        Ok(())
    }

    /// Re-added or added file: if its inode is already represented in the
    /// image, share content with that representation (hard-link fusion).
    /// Content refreshed earlier in this run is preferred; a stale sibling
    /// is only trusted for plain additions, where its own visit verifies
    /// it separately.
    fn fuse_hardlinks(
        &mut self,
        disk_path: &Path,
        iso_path: &str,
        was_added: bool,
        mask: &mut DiffMask,
    ) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let meta = std::fs::symlink_metadata(disk_path)?;
            if !meta.is_file() {
                return Ok(());
            }
            let key = (meta.dev(), meta.ino());
            if meta.nlink() <= 1 {
                self.updated_inodes.insert(key, iso_path.to_string());
                return Ok(());
            }

            let donor = match self.updated_inodes.get(&key) {
                Some(path) if path != iso_path => Some(path.clone()),
                _ if was_added => self
                    .image
                    .tree
                    .hardlink_siblings(key.0, key.1)
                    .into_iter()
                    .find(|p| p != iso_path),
                _ => None,
            };
            if let Some(donor) = donor {
                let shared = self.image.tree.lookup(&donor)?.file_content().cloned();
                if let Some(shared) = shared {
                    let node = self.image.tree.lookup_mut(iso_path)?;
                    node.kind = NodeKind::File(shared);
                    node.recorded = Some(key);
                    *mask |= DiffMask::HARDLINK_FUSION;
                    self.info(
                        Severity::Note,
                        format!("Hard link fusion of {iso_path} with {donor}"),
                    );
                }
            }
            self.updated_inodes.insert(key, iso_path.to_string());
        }
        Ok(())
    }

    /// Disk file left its recorded hard-link family: the siblings keep the
    /// old shared content, this node gets its own.
    fn note_hardlink_split(
        &mut self,
        iso_path: &str,
        _disk_path: &Path,
        mask: &mut DiffMask,
    ) -> Result<()> {
        let recorded = self.image.tree.lookup(iso_path)?.recorded;
        if let Some((dev, ino)) = recorded {
            let family = self.image.tree.hardlink_siblings(dev, ino);
            if family.len() > 1 {
                *mask |= DiffMask::HARDLINK_SPLIT;
                self.info(
                    Severity::Note,
                    format!("Hard link split of {iso_path} from its family"),
                );
            }
        }
        Ok(())
    }
}

/// Extraction direction: the image is the source, the disk the
/// destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractOptions {
    /// Read file content in ascending image LBA order. Turns random
    /// access into a near-sequential pattern, which optical media want.
    pub sort_lba: bool,
}

/// Extracts an image subtree into a disk directory. Returns the number of
/// files written.
pub fn extract(
    image: &mut Image,
    iso_root: &str,
    disk_root: &Path,
    opts: &ExtractOptions,
    abort: &AbortFlag,
) -> Result<usize> {
    struct FileJob {
        rel: PathBuf,
        content: Arc<FileContent>,
        mode: u32,
        sort_key: u32,
    }

    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut links: Vec<(PathBuf, String)> = Vec::new();
    let mut jobs: Vec<FileJob> = Vec::new();
    {
        let root = image.tree.lookup(iso_root)?;
        let mut stack: Vec<(PathBuf, &Node)> = vec![(PathBuf::new(), root)];
        while let Some((rel, node)) = stack.pop() {
            match &node.kind {
                NodeKind::Directory(children) => {
                    if !rel.as_os_str().is_empty() {
                        dirs.push(rel.clone());
                    }
                    for child in children {
                        stack.push((rel.join(&child.name), child));
                    }
                }
                NodeKind::File(content) => {
                    let sort_key = match &content.source {
                        ContentSource::Image(extents) => {
                            extents.first().map(|e| e.start).unwrap_or(0)
                        }
                        _ => 0,
                    };
                    jobs.push(FileJob {
                        rel: rel.clone(),
                        content: content.clone(),
                        mode: node.mode,
                        sort_key,
                    });
                }
                NodeKind::Symlink(target) => {
                    links.push((rel.clone(), target.clone()));
                }
                _ => {
                    tracing::debug!(path = %rel.display(), "special node skipped on extract");
                }
            }
        }
    }

    // Destination directories first, shallow before deep.
    dirs.sort();
    std::fs::create_dir_all(disk_root)?;
    for dir in &dirs {
        std::fs::create_dir_all(disk_root.join(dir))?;
    }

    if opts.sort_lba {
        jobs.sort_by_key(|j| j.sort_key);
    } else {
        jobs.sort_by(|a, b| a.rel.cmp(&b.rel));
    }

    let mut written = 0usize;
    let mut buf = vec![0u8; COMPARE_CHUNK];
    for job in &jobs {
        if abort.is_requested() {
            return Err(Error::Aborted);
        }
        use std::io::Write;
        let dest_path = disk_root.join(&job.rel);
        let mut dest = std::fs::File::create(&dest_path)?;
        let mut pos: u64 = 0;
        while pos < job.content.size {
            if abort.is_requested() {
                return Err(Error::Aborted);
            }
            let n = image.read_content_range(&job.content, pos, &mut buf)?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])?;
            pos += n as u64;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest_path, std::fs::Permissions::from_mode(job.mode))?;
        }
        written += 1;
    }

    #[cfg(unix)]
    for (rel, target) in &links {
        let dest_path = disk_root.join(rel);
        let _ = std::fs::remove_file(&dest_path);
        std::os::unix::fs::symlink(target, &dest_path)?;
    }

    Ok(written)
}

fn md5_of_file(path: &Path, abort: &AbortFlag) -> Result<[u8; 16]> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; COMPARE_CHUNK];
    loop {
        if abort.is_requested() {
            return Err(Error::Aborted);
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_names_round_trip() {
        let part = SplitPart {
            partno: 2,
            total_parts: 3,
            offset: 1048576,
            bytes: 1048576,
            total_bytes: 2621440,
        };
        let name = compose_split_name(&part);
        assert_eq!(name, "part_2_of_3_at_1048576_with_1048576_of_2621440");
        assert_eq!(parse_split_name(&name), Some(part));
        assert_eq!(parse_split_name("part_x_of_3_at_0_with_1_of_2"), None);
        assert_eq!(parse_split_name("README"), None);
    }

    #[test]
    fn informational_bits_do_not_make_a_pair_dirty() {
        let mask = DiffMask::SPLIT_CHUNKS | DiffMask::DEV_INO_MISSING;
        assert!(mask.is_clean());
        assert!(!(mask | DiffMask::CONTENT).is_clean());
    }
}
