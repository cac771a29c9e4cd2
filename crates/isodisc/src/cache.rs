//! Tiled read cache between the filesystem reader and the raw block source.
//!
//! Reads go through fixed-size tiles with approximate LRU eviction. A tile
//! miss loads a whole tile from the backing source (read-ahead); if that
//! fails, a single-block read of the requested address is attempted before
//! the error is surfaced. Known-bad addresses are remembered per tile so a
//! damaged sector is not retried on every lookup.

use crate::source::{BLOCK_SIZE, BlockSource};
use crate::{Error, Result};

/// Default number of tiles.
pub const DEFAULT_TILES: usize = 32;
/// Default tile size in blocks (64 KiB per tile).
pub const DEFAULT_TILE_BLOCKS: u32 = 32;
/// Total cache payload must stay at or below 1 GiB.
pub const MAX_CACHE_BYTES: u64 = 1 << 30;

/// Age counter cap. Reaching it rewrites all tile ages relative to 0; the
/// LRU order is approximate for a moment, which needs billions of reads to
/// matter.
const MAX_AGE: u32 = 2_000_000_000;

/// Signed displacement applied to every read address, compensating for an
/// image stored at a different position than it was authored for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Displacement {
    #[default]
    None,
    Plus(u32),
    Minus(u32),
}

impl Displacement {
    /// Applies the displacement, rejecting 32-bit roll-over.
    pub fn apply(self, lba: u32) -> Result<u32> {
        match self {
            Displacement::None => Ok(lba),
            Displacement::Plus(d) => lba.checked_add(d).ok_or(Error::DisplaceRollover),
            Displacement::Minus(d) => lba.checked_sub(d).ok_or(Error::DisplaceRollover),
        }
    }
}

struct CacheTile {
    /// Aligned base address of the payload, `None` while the tile is empty.
    base_lba: Option<u32>,
    payload: Vec<u8>,
    age: u32,
    hits: u32,
    last_error_lba: Option<u32>,
    last_aligned_error_lba: Option<u32>,
}

impl CacheTile {
    fn new(tile_blocks: u32) -> Self {
        Self {
            base_lba: None,
            payload: vec![0u8; tile_blocks as usize * BLOCK_SIZE],
            age: 0,
            hits: 0,
            last_error_lba: None,
            last_aligned_error_lba: None,
        }
    }
}

/// LRU cache of N tiles x M blocks over a [`BlockSource`].
///
/// The cache owns the source exclusively. [`TiledCache::shutdown`] detaches
/// it again; a shut-down cache answers every read with
/// [`Error::AssertFailure`], so higher layers holding a reference fail
/// loudly instead of touching a released drive.
pub struct TiledCache {
    source: Option<Box<dyn BlockSource>>,
    tiles: Vec<CacheTile>,
    tile_blocks: u32,
    current_age: u32,
    displacement: Displacement,
}

impl std::fmt::Debug for TiledCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledCache")
            .field("source", &self.source.is_some())
            .field("tiles", &self.tiles.len())
            .field("tile_blocks", &self.tile_blocks)
            .field("current_age", &self.current_age)
            .field("displacement", &self.displacement)
            .finish()
    }
}

impl TiledCache {
    /// Creates a cache with the given geometry. `tiles` must be at least 1,
    /// `tile_blocks` a power of two, and the total payload at most 1 GiB.
    pub fn new(
        source: Box<dyn BlockSource>,
        tiles: usize,
        tile_blocks: u32,
        displacement: Displacement,
    ) -> Result<Self> {
        if tiles == 0 || tile_blocks == 0 || !tile_blocks.is_power_of_two() {
            return Err(Error::BadGeometry {
                tiles,
                tile_blocks,
            });
        }
        let total = tiles as u64 * tile_blocks as u64 * BLOCK_SIZE as u64;
        if total > MAX_CACHE_BYTES {
            return Err(Error::BadGeometry {
                tiles,
                tile_blocks,
            });
        }
        Ok(Self {
            source: Some(source),
            tiles: (0..tiles).map(|_| CacheTile::new(tile_blocks)).collect(),
            tile_blocks,
            current_age: 0,
            displacement,
        })
    }

    pub fn with_defaults(source: Box<dyn BlockSource>) -> Result<Self> {
        Self::new(source, DEFAULT_TILES, DEFAULT_TILE_BLOCKS, Displacement::None)
    }

    pub fn displacement(&self) -> Displacement {
        self.displacement
    }

    /// Detaches and returns the backing source. Subsequent reads fail with
    /// [`Error::AssertFailure`].
    pub fn shutdown(&mut self) -> Option<Box<dyn BlockSource>> {
        self.source.take()
    }

    pub fn is_shut_down(&self) -> bool {
        self.source.is_none()
    }

    /// Reads one 2048-byte block at `lba` (before displacement).
    pub fn read_block(&mut self, lba: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let lba = self.displacement.apply(lba)?;
        let aligned_lba = lba & !(self.tile_blocks - 1);
        let offset = (lba - aligned_lba) as usize * BLOCK_SIZE;

        if self.source.is_none() {
            // Drive was released while a reader still holds the cache.
            return Err(Error::AssertFailure(
                "drive released while reads are still attempted",
            ));
        }

        for i in 0..self.tiles.len() {
            if self.tiles[i].base_lba == Some(aligned_lba) {
                self.tiles[i].hits += 1;
                self.stamp_age(i);
                let tile = &self.tiles[i];
                buf.copy_from_slice(&tile.payload[offset..offset + BLOCK_SIZE]);
                return Ok(());
            }
        }

        // Miss: the first empty tile is the victim, else the oldest.
        let mut victim = 0;
        let mut oldest_age = MAX_AGE;
        for (i, tile) in self.tiles.iter().enumerate() {
            if tile.base_lba.is_none() {
                victim = i;
                break;
            }
            if tile.age < oldest_age {
                oldest_age = tile.age;
                victim = i;
            }
        }

        self.tiles[victim].base_lba = None;
        let tile_read_ok = if self.tiles[victim].last_aligned_error_lba == Some(aligned_lba) {
            false
        } else {
            let source = self.source.as_mut().unwrap();
            let tile_blocks = self.tile_blocks;
            match source.read_blocks(
                aligned_lba as u64,
                &mut self.tiles[victim].payload[..tile_blocks as usize * BLOCK_SIZE],
            ) {
                Ok(()) => true,
                Err(_) => false,
            }
        };

        if !tile_read_ok {
            self.tiles[victim].last_aligned_error_lba = Some(aligned_lba);

            // Read-ahead failure? Try the single requested block directly.
            if self.tiles[victim].last_error_lba != Some(lba) {
                let source = self.source.as_mut().unwrap();
                if source.read_blocks(lba as u64, buf).is_ok() {
                    return Ok(());
                }
            }
            self.tiles[victim].last_error_lba = Some(lba);
            tracing::debug!(lba, "tile and single-block read both failed");
            return Err(Error::DataSourceMishap(lba));
        }

        self.tiles[victim].base_lba = Some(aligned_lba);
        self.tiles[victim].hits = 1;
        self.stamp_age(victim);
        tracing::trace!(
            tile = victim,
            base = aligned_lba,
            "cache tile loaded"
        );

        let tile = &self.tiles[victim];
        buf.copy_from_slice(&tile.payload[offset..offset + BLOCK_SIZE]);
        Ok(())
    }

    /// Reads a run of blocks through the cache.
    pub fn read_blocks(&mut self, lba: u32, count: u32, out: &mut Vec<u8>) -> Result<()> {
        let mut block = [0u8; BLOCK_SIZE];
        for i in 0..count {
            self.read_block(lba + i, &mut block)?;
            out.extend_from_slice(&block);
        }
        Ok(())
    }

    fn stamp_age(&mut self, idx: usize) {
        self.current_age += 1;
        if self.current_age >= MAX_AGE {
            for tile in &mut self.tiles {
                tile.age = 0;
            }
            self.current_age = 1;
        }
        self.tiles[idx].age = self.current_age;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemSource;

    fn patterned_source(blocks: u64) -> MemSource {
        let mut src = MemSource::new(blocks);
        for lba in 0..blocks {
            let mut block = [0u8; BLOCK_SIZE];
            block[0] = lba as u8;
            block[1] = (lba >> 8) as u8;
            src.fill(lba, &block);
        }
        src
    }

    fn read_one(cache: &mut TiledCache, lba: u32) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        cache.read_block(lba, &mut buf).unwrap();
        buf
    }

    #[test]
    fn cached_reads_match_raw_reads_in_any_order() {
        let blocks = 64;
        let raw = patterned_source(blocks);
        let expected = raw.data().to_vec();

        // Small cache so evictions happen, scrambled access order.
        let mut cache =
            TiledCache::new(Box::new(raw), 2, 4, Displacement::None).unwrap();
        let order: Vec<u32> = (0..blocks as u32)
            .chain((0..blocks as u32).rev())
            .chain([7, 63, 0, 31, 32, 1, 62, 15].into_iter())
            .collect();
        for lba in order {
            let got = read_one(&mut cache, lba);
            let at = lba as usize * BLOCK_SIZE;
            assert_eq!(&got[..], &expected[at..at + BLOCK_SIZE], "lba {lba}");
        }
    }

    struct CountingSource {
        inner: MemSource,
        log: std::sync::Arc<std::sync::Mutex<Vec<u64>>>,
    }

    impl BlockSource for CountingSource {
        fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> crate::Result<()> {
            self.log.lock().unwrap().push(lba);
            self.inner.read_blocks(lba, buf)
        }
        fn read_capacity(&mut self) -> crate::source::Capacity {
            self.inner.read_capacity()
        }
        fn role(&self) -> crate::source::SourceRole {
            self.inner.role()
        }
        fn caps(&self) -> crate::source::SourceCaps {
            self.inner.caps()
        }
        fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> crate::Result<()> {
            self.inner.write_blocks(lba, buf)
        }
        fn truncate_to(&mut self, blocks: u64) -> crate::Result<()> {
            self.inner.truncate_to(blocks)
        }
        fn release(&mut self) -> crate::Result<()> {
            self.inner.release()
        }
        fn disc_status(&mut self) -> crate::source::DiscStatus {
            self.inner.disc_status()
        }
    }

    #[test]
    fn least_recently_hit_tile_is_evicted_first() {
        // 2 tiles of 4 blocks over 4 tile-sized regions.
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let src = CountingSource {
            inner: patterned_source(16),
            log: log.clone(),
        };
        let mut cache = TiledCache::new(Box::new(src), 2, 4, Displacement::None).unwrap();

        read_one(&mut cache, 0); // tile A := region 0
        read_one(&mut cache, 4); // tile B := region 1
        read_one(&mut cache, 0); // region 0 becomes most recent
        read_one(&mut cache, 8); // must evict region 1, not region 0
        read_one(&mut cache, 1); // region 0: still a hit
        read_one(&mut cache, 4); // region 1: was evicted, reloads

        assert_eq!(*log.lock().unwrap(), vec![0, 4, 8, 4]);
    }

    #[test]
    fn displacement_round_trip() {
        let src = patterned_source(64);
        let plain = src.data().to_vec();

        let mut plus =
            TiledCache::new(Box::new(patterned_source(64)), 4, 4, Displacement::Plus(10)).unwrap();
        let got = read_one(&mut plus, 5);
        assert_eq!(&got[..2], &plain[15 * BLOCK_SIZE..15 * BLOCK_SIZE + 2]);

        let mut minus =
            TiledCache::new(Box::new(src), 4, 4, Displacement::Minus(10)).unwrap();
        let got = read_one(&mut minus, 15);
        assert_eq!(&got[..2], &plain[5 * BLOCK_SIZE..5 * BLOCK_SIZE + 2]);
    }

    #[test]
    fn displacement_rollover_is_an_error() {
        let src = patterned_source(8);
        let mut cache =
            TiledCache::new(Box::new(src), 2, 2, Displacement::Minus(100)).unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            cache.read_block(5, &mut buf),
            Err(Error::DisplaceRollover)
        ));

        let src = patterned_source(8);
        let mut cache =
            TiledCache::new(Box::new(src), 2, 2, Displacement::Plus(u32::MAX - 1)).unwrap();
        assert!(matches!(
            cache.read_block(5, &mut buf),
            Err(Error::DisplaceRollover)
        ));
    }

    #[test]
    fn bad_block_falls_back_to_single_read_then_reports_mishap() {
        let mut src = patterned_source(16);
        // Block 5 is bad; a tile read covering it fails, the direct read of
        // block 4 must still succeed.
        src.mark_bad(5);
        let mut cache = TiledCache::new(Box::new(src), 2, 4, Displacement::None).unwrap();

        let got = read_one(&mut cache, 4);
        assert_eq!(got[0], 4);

        let mut buf = [0u8; BLOCK_SIZE];
        let err = cache.read_block(5, &mut buf).unwrap_err();
        assert!(matches!(err, Error::DataSourceMishap(5)));
        // Second attempt is suppressed by the recorded error address.
        let err = cache.read_block(5, &mut buf).unwrap_err();
        assert!(matches!(err, Error::DataSourceMishap(5)));
    }

    #[test]
    fn shutdown_turns_reads_into_assert_failures() {
        let src = patterned_source(8);
        let mut cache = TiledCache::with_defaults(Box::new(src)).unwrap();
        let drive = cache.shutdown();
        assert!(drive.is_some());
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            cache.read_block(0, &mut buf),
            Err(Error::AssertFailure(_))
        ));
    }

    #[test]
    fn geometry_is_validated() {
        let make = |tiles, tile_blocks| {
            TiledCache::new(
                Box::new(MemSource::new(1)),
                tiles,
                tile_blocks,
                Displacement::None,
            )
        };
        assert!(make(0, 32).is_err());
        assert!(make(32, 0).is_err());
        assert!(make(32, 31).is_err());
        assert!(make(32, 32).is_ok());
        // 1 GiB cap: 1024 tiles x 512 blocks x 2048 B = 1 GiB exactly.
        assert!(make(1024, 512).is_ok());
        assert!(make(1025, 512).is_err());
    }
}
