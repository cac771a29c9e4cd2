//! Image loading: from a classified medium to a node tree.
//!
//! The loader picks the session to read, wraps the drive in a tiled cache
//! with the configured displacement, and hands the cache to a tree builder.
//! The builder interface decouples the byte-level decoders; the crate ships
//! a plain ISO 9660 builder that understands the volume descriptors and
//! directory records written by the session writer.

use std::sync::Arc;

use isodisc_msg::{Channel, MessageBus, Severity};

use crate::cache::{DEFAULT_TILE_BLOCKS, DEFAULT_TILES, Displacement, TiledCache};
use crate::medium::{ClassifiedMedium, MSG_CODE};
use crate::source::{BLOCK_SIZE, BlockSource, DiscStatus};
use crate::tree::{ContentSource, Extent, FileContent, Node, NodeKind, NodeTree};
use crate::volume::{
    DirectoryRecord, pvd_sanity_ok, recognize_pvd, volume_id, volume_space_size,
};
use crate::{Error, Result};

/// What to load and how, mapped one-to-one to the tree builder.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub no_rock: bool,
    pub no_joliet: bool,
    pub no_iso1999: bool,
    pub no_aaip: bool,
    pub no_acl: bool,
    pub no_ea: bool,
    /// Do not restore recorded inode numbers.
    pub no_inode: bool,
    /// 0 = load MD5 data, 1 = do not load, 2 = do not even check tags.
    pub no_md5: u8,
    pub prefer_joliet: bool,
    pub default_uid: u32,
    pub default_gid: u32,
    pub default_file_mode: u32,
    pub default_dir_mode: u32,
    pub input_charset: Option<String>,
    pub auto_input_charset: bool,
    pub cache_tiles: usize,
    pub cache_tile_blocks: u32,
    pub displacement: Displacement,
    pub pretend_blank: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            no_rock: false,
            no_joliet: false,
            no_iso1999: false,
            no_aaip: false,
            no_acl: false,
            no_ea: false,
            no_inode: false,
            no_md5: 0,
            prefer_joliet: false,
            default_uid: 0,
            default_gid: 0,
            default_file_mode: 0o644,
            default_dir_mode: 0o755,
            input_charset: None,
            auto_input_charset: false,
            cache_tiles: DEFAULT_TILES,
            cache_tile_blocks: DEFAULT_TILE_BLOCKS,
            displacement: Displacement::None,
            pretend_blank: false,
        }
    }
}

/// Which extension sets the builder actually found in the image.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadedFeatures {
    pub has_rockridge: bool,
    pub has_joliet: bool,
    pub has_iso1999: bool,
    pub has_el_torito: bool,
    /// Absolute end of the image in blocks.
    pub image_blocks: u32,
}

/// Builds a node tree by reading through the cache from a session start.
/// Implementations own the byte-level decoding of directory structures and
/// their extensions.
pub trait TreeBuilder {
    fn build(
        &mut self,
        cache: &mut TiledCache,
        start_lba: u32,
        opts: &ReadOptions,
    ) -> Result<(Node, String, LoadedFeatures)>;
}

/// A loaded image: the tree, what was found, and the cache that still owns
/// the drive for content reads.
#[derive(Debug)]
pub struct Image {
    pub tree: NodeTree,
    pub features: LoadedFeatures,
    pub volume_id: String,
    /// Session start the tree was read from; `None` for fresh images.
    pub start_lba: Option<u32>,
    cache: Option<TiledCache>,
}

impl Image {
    /// A fresh empty image without relation to a drive.
    pub fn new_blank(opts: &ReadOptions) -> Self {
        let mut tree = NodeTree::new_empty();
        tree.root.mode = 0o755;
        tree.root.uid = opts.default_uid;
        tree.root.gid = opts.default_gid;
        Self {
            tree,
            features: LoadedFeatures::default(),
            volume_id: "ISOIMAGE".to_string(),
            start_lba: None,
            cache: None,
        }
    }

    pub fn cache_mut(&mut self) -> Option<&mut TiledCache> {
        self.cache.as_mut()
    }

    /// Takes the drive back out of the cache. The cache stays attached in
    /// its disabled state, so stale readers fail loudly.
    pub fn detach_drive(&mut self) -> Option<Box<dyn BlockSource>> {
        self.cache.as_mut().and_then(|c| c.shutdown())
    }

    pub(crate) fn adopt_cache(&mut self, cache: TiledCache) {
        self.cache = Some(cache);
    }

    /// Reads a byte range of a file's content, wherever it lives. Returns
    /// the number of bytes read; short counts signal the end of content.
    pub fn read_content_range(
        &mut self,
        content: &FileContent,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= content.size {
            return Ok(0);
        }
        let want = buf.len().min((content.size - offset) as usize);
        match &content.source {
            ContentSource::Bytes(bytes) => {
                let at = offset as usize;
                buf[..want].copy_from_slice(&bytes[at..at + want]);
                Ok(want)
            }
            ContentSource::Disk { path, offset: base, .. } => {
                use std::io::{Read, Seek, SeekFrom};
                let mut file = std::fs::File::open(path)?;
                file.seek(SeekFrom::Start(base + offset))?;
                let mut done = 0;
                while done < want {
                    let n = file.read(&mut buf[done..want])?;
                    if n == 0 {
                        break;
                    }
                    done += n;
                }
                Ok(done)
            }
            ContentSource::Image(extents) => {
                let cache = self
                    .cache
                    .as_mut()
                    .ok_or(Error::AssertFailure("image content without a cache"))?;
                read_extent_range(cache, extents, offset, &mut buf[..want])
            }
        }
    }

    /// Reads the whole content of a file node.
    pub fn read_content(&mut self, content: &FileContent) -> Result<Vec<u8>> {
        let mut out = vec![0u8; content.size as usize];
        let mut done = 0;
        while done < out.len() {
            let n = self.read_content_range(content, done as u64, &mut out[done..])?;
            if n == 0 {
                return Err(Error::ReadFailed {
                    lba: 0,
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "content shorter than recorded size",
                    ),
                });
            }
            done += n;
        }
        Ok(out)
    }
}

fn read_extent_range(
    cache: &mut TiledCache,
    extents: &[Extent],
    mut offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let mut done = 0;
    let mut block = [0u8; BLOCK_SIZE];
    'extents: for extent in extents {
        let len = extent.byte_len();
        if offset >= len {
            offset -= len;
            continue;
        }
        let mut pos = offset;
        offset = 0;
        while pos < len && done < buf.len() {
            let lba = extent.start + (pos / BLOCK_SIZE as u64) as u32;
            cache.read_block(lba, &mut block)?;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let take = (BLOCK_SIZE - in_block)
                .min(buf.len() - done)
                .min((len - pos) as usize);
            buf[done..done + take].copy_from_slice(&block[in_block..in_block + take]);
            done += take;
            pos += take as u64;
        }
        if done == buf.len() {
            break 'extents;
        }
    }
    Ok(done)
}

/// Loads the image of the selected session.
///
/// Blank media (or `pretend_blank`) produce a fresh empty image. A prior
/// image with pending changes rejects the load; commit or roll back first.
/// On failure the drive is handed back to the medium and the prior image
/// reference stays untouched.
pub fn load_image(
    medium: &mut ClassifiedMedium,
    opts: &ReadOptions,
    prior: Option<&Image>,
    builder: &mut dyn TreeBuilder,
    bus: &Arc<MessageBus>,
) -> Result<Image> {
    if let Some(prior) = prior {
        if prior.tree.changes_pending {
            bus.submit_text(
                MSG_CODE,
                Severity::Failure,
                Channel::Info,
                "Image changes pending. Commit or rollback first",
            );
            return Err(Error::ChangesPending);
        }
    }

    let status = medium.status();
    if status == DiscStatus::Blank || opts.pretend_blank {
        return Ok(Image::new_blank(opts));
    }
    if status != DiscStatus::Appendable && status != DiscStatus::Closed {
        bus.submit_text(
            MSG_CODE,
            Severity::Fatal,
            Channel::Info,
            "Incorrect disc status for image loading",
        );
        return Err(Error::WrongState(format!(
            "cannot load from medium in state {status:?}"
        )));
    }

    let msc1 = medium.msc1()?;

    // The tree builder works in image address space; the displacement maps
    // it back to the real position, so the session start moves the other
    // way.
    let ms_block = match opts.displacement {
        Displacement::None => msc1,
        Displacement::Plus(d) => msc1.checked_sub(d).ok_or_else(|| {
            bus.submit_text(
                MSG_CODE,
                Severity::Failure,
                Channel::Info,
                "Displacement offset leads outside 32 bit range",
            );
            Error::DisplaceRollover
        })?,
        Displacement::Minus(d) => msc1.checked_add(d).ok_or_else(|| {
            bus.submit_text(
                MSG_CODE,
                Severity::Failure,
                Channel::Info,
                "Displacement offset leads outside 32 bit range",
            );
            Error::DisplaceRollover
        })?,
    };

    let drive = medium.take_drive()?;
    let mut cache = match TiledCache::new(
        drive,
        opts.cache_tiles,
        opts.cache_tile_blocks,
        opts.displacement,
    ) {
        Ok(cache) => cache,
        Err(err) => return Err(err),
    };

    // No recognizable image at the session start degrades to a blank
    // image, mirroring what an interactive loader would offer.
    let mut probe = [0u8; BLOCK_SIZE];
    let recognized = cache
        .read_block(ms_block + 16, &mut probe)
        .map(|()| recognize_pvd(&probe))
        .unwrap_or(false);
    if !recognized {
        bus.submit_text(
            MSG_CODE,
            Severity::Warning,
            Channel::Info,
            format!("No ISO 9660 image at LBA {ms_block}. Creating blank image."),
        );
        if let Some(drive) = cache.shutdown() {
            medium.attach_drive(drive);
        }
        return Ok(Image::new_blank(opts));
    }

    match builder.build(&mut cache, ms_block, opts) {
        Ok((root, volid, features)) => {
            tracing::debug!(
                start = ms_block,
                blocks = features.image_blocks,
                "image loaded"
            );
            let mut image = Image {
                tree: NodeTree {
                    root,
                    changes_pending: false,
                },
                features,
                volume_id: volid,
                start_lba: Some(ms_block),
                cache: None,
            };
            image.adopt_cache(cache);
            Ok(image)
        }
        Err(err) => {
            bus.submit_text(
                MSG_CODE,
                Severity::Failure,
                Channel::Info,
                format!("Cannot import image: {err}"),
            );
            if let Some(drive) = cache.shutdown() {
                medium.attach_drive(drive);
            }
            Err(err)
        }
    }
}

/// Reads the single-session volume layout the session writer produces:
/// plain ISO 9660 directory records, no Rock Ridge or Joliet trees.
#[derive(Debug, Default)]
pub struct PlainIso9660Builder;

impl PlainIso9660Builder {
    fn read_directory(
        &self,
        cache: &mut TiledCache,
        extent: u32,
        data_len: u32,
        opts: &ReadOptions,
        depth: u32,
    ) -> Result<Vec<Node>> {
        if depth > 64 {
            return Err(Error::BadSuperblock);
        }
        let blocks = data_len.div_ceil(BLOCK_SIZE as u32);
        let mut bytes = Vec::with_capacity((blocks as usize) * BLOCK_SIZE);
        cache.read_blocks(extent, blocks, &mut bytes)?;
        bytes.truncate(data_len as usize);

        let mut nodes = Vec::new();
        let mut at = 0usize;
        while at < bytes.len() {
            match DirectoryRecord::parse(&bytes[at..]) {
                None => {
                    // Records do not cross block boundaries; skip ahead.
                    at = (at / BLOCK_SIZE + 1) * BLOCK_SIZE;
                }
                Some(record) => {
                    at += record.size();
                    if record.is_dot_entry() {
                        continue;
                    }
                    let name = decode_identifier(&record.name);
                    let mtime = record.header.date_time.to_epoch();
                    let mut node = if record.header.is_directory() {
                        let children = self.read_directory(
                            cache,
                            record.header.extent.get(),
                            record.header.data_len.get(),
                            opts,
                            depth + 1,
                        )?;
                        let mut node = Node::new(&name, NodeKind::Directory(children));
                        node.mode = opts.default_dir_mode;
                        node
                    } else {
                        let extent = Extent::for_size(
                            record.header.extent.get(),
                            record.header.data_len.get() as u64,
                        );
                        let mut extents = vec![extent];
                        // Multi-extent files: further records of the same
                        // identifier follow while NOT_FINAL is set.
                        let mut final_seen = record.header.is_final_extent();
                        while !final_seen && at < bytes.len() {
                            match DirectoryRecord::parse(&bytes[at..]) {
                                Some(next) if next.name == record.name => {
                                    at += next.size();
                                    extents.push(Extent::for_size(
                                        next.header.extent.get(),
                                        next.header.data_len.get() as u64,
                                    ));
                                    final_seen = next.header.is_final_extent();
                                }
                                _ => break,
                            }
                        }
                        let mut node =
                            Node::new_file(&name, FileContent::from_extents(extents));
                        node.mode = opts.default_file_mode;
                        node
                    };
                    node.uid = opts.default_uid;
                    node.gid = opts.default_gid;
                    node.mtime = mtime;
                    node.atime = mtime;
                    node.ctime = mtime;
                    nodes.push(node);
                }
            }
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }
}

/// Strips the ";1" version suffix of an ISO file identifier.
fn decode_identifier(raw: &[u8]) -> String {
    let text: String = raw.iter().map(|&b| b as char).collect();
    match text.rsplit_once(';') {
        Some((stem, version)) if version.bytes().all(|b| b.is_ascii_digit()) => {
            stem.to_string()
        }
        _ => text,
    }
}

impl TreeBuilder for PlainIso9660Builder {
    fn build(
        &mut self,
        cache: &mut TiledCache,
        start_lba: u32,
        opts: &ReadOptions,
    ) -> Result<(Node, String, LoadedFeatures)> {
        let mut pvd_block = [0u8; BLOCK_SIZE];
        cache.read_block(start_lba + 16, &mut pvd_block)?;
        if !recognize_pvd(&pvd_block) {
            return Err(Error::NotAnIso);
        }
        if !pvd_sanity_ok(&pvd_block) {
            return Err(Error::BadSuperblock);
        }
        let volid = volume_id(&pvd_block);
        let space = volume_space_size(&pvd_block);

        let pvd = crate::volume::PrimaryVolumeDescriptor::from_block(&pvd_block);
        let root_record = pvd.root_record().ok_or(Error::BadSuperblock)?;
        let children = self.read_directory(
            cache,
            root_record.header.extent.get(),
            root_record.header.data_len.get(),
            opts,
            0,
        )?;
        let mut root = Node::new("", NodeKind::Directory(children));
        root.mode = opts.default_dir_mode;
        root.mtime = root_record.header.date_time.to_epoch();

        let features = LoadedFeatures {
            has_rockridge: false,
            has_joliet: false,
            has_iso1999: false,
            has_el_torito: false,
            image_blocks: start_lba + space,
        };
        Ok((root, volid, features))
    }
}
