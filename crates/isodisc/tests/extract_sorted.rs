//! LBA-sorted extraction keeps backend reads near-sequential.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use isodisc::source::{
    BlockSource, Capacity, DiscStatus, MemSource, SourceCaps, SourceRole,
};
use isodisc::update::{ExtractOptions, extract};
use isodisc::{
    AbortFlag, ClassifyOptions, FileContent, Image, MessageBus, Node, PlainIso9660Builder,
    ReadOptions, WriteOptions, classify, commit_session, load_image,
};

/// Wraps a source and logs read addresses while enabled.
struct LoggingSource {
    inner: MemSource,
    log: Arc<Mutex<Vec<u64>>>,
    enabled: Arc<AtomicBool>,
}

impl BlockSource for LoggingSource {
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> isodisc::Result<()> {
        if self.enabled.load(Ordering::Relaxed) {
            self.log.lock().unwrap().push(lba);
        }
        self.inner.read_blocks(lba, buf)
    }
    fn read_capacity(&mut self) -> Capacity {
        self.inner.read_capacity()
    }
    fn role(&self) -> SourceRole {
        self.inner.role()
    }
    fn caps(&self) -> SourceCaps {
        self.inner.caps()
    }
    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> isodisc::Result<()> {
        self.inner.write_blocks(lba, buf)
    }
    fn truncate_to(&mut self, blocks: u64) -> isodisc::Result<()> {
        self.inner.truncate_to(blocks)
    }
    fn release(&mut self) -> isodisc::Result<()> {
        self.inner.release()
    }
    fn disc_status(&mut self) -> DiscStatus {
        self.inner.disc_status()
    }
}

fn file_body(i: usize) -> Vec<u8> {
    format!("file number {i} ").repeat(40).into_bytes()
}

#[test]
fn extraction_reads_monotonically_when_sorted_by_lba() {
    let bus = MessageBus::new();
    bus.set_sink(Box::new(|_| {}));
    let bus = Arc::new(bus);

    let log = Arc::new(Mutex::new(Vec::new()));
    let enabled = Arc::new(AtomicBool::new(false));
    let src = LoggingSource {
        inner: MemSource::new(8192),
        log: log.clone(),
        enabled: enabled.clone(),
    };
    let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus.clone());

    // Session 1 holds the even-numbered files. Session 2 adds the odd
    // ones, so name order alternates between low and high block
    // addresses.
    let count = 120usize;
    let mut image = Image::new_blank(&ReadOptions::default());
    for i in (0..count).step_by(2) {
        image
            .tree
            .add_child(
                "/",
                Node::new_file(&format!("f{i:03}"), FileContent::from_bytes(file_body(i))),
            )
            .unwrap();
    }
    commit_session(&mut medium, &mut image, &WriteOptions::default(), &bus).unwrap();

    for i in (1..count).step_by(2) {
        image
            .tree
            .add_child(
                "/",
                Node::new_file(&format!("f{i:03}"), FileContent::from_bytes(file_body(i))),
            )
            .unwrap();
    }
    commit_session(&mut medium, &mut image, &WriteOptions::default(), &bus).unwrap();

    // Load the merged tree back.
    let drive = medium.take_drive().unwrap();
    let mut medium = classify(drive, &ClassifyOptions::default(), bus.clone());
    let mut builder = PlainIso9660Builder;
    let mut image = load_image(
        &mut medium,
        &ReadOptions::default(),
        None,
        &mut builder,
        &bus,
    )
    .unwrap();

    // Only extraction reads count.
    enabled.store(true, Ordering::Relaxed);
    let dest = tempfile::tempdir().unwrap();
    let written = extract(
        &mut image,
        "/",
        dest.path(),
        &ExtractOptions { sort_lba: true },
        &AbortFlag::new(),
    )
    .unwrap();
    enabled.store(false, Ordering::Relaxed);
    assert_eq!(written, count);

    let reads = log.lock().unwrap().clone();
    assert!(!reads.is_empty());
    assert!(
        reads.windows(2).all(|w| w[0] <= w[1]),
        "backend reads not monotone: {reads:?}"
    );

    // Every destination file matches its image content.
    for i in 0..count {
        let body = std::fs::read(dest.path().join(format!("f{i:03}"))).unwrap();
        assert_eq!(body, file_body(i), "file {i}");
    }
}

#[test]
fn unsorted_extraction_still_extracts_everything() {
    let bus = MessageBus::new();
    bus.set_sink(Box::new(|_| {}));
    let bus = Arc::new(bus);

    let src = MemSource::new(1 << 14);
    let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus.clone());
    let mut image = Image::new_blank(&ReadOptions::default());
    image.tree.mkdir("/nested").unwrap();
    image
        .tree
        .add_child(
            "/nested",
            Node::new_file("inner", FileContent::from_bytes(b"inner".to_vec())),
        )
        .unwrap();
    image
        .tree
        .add_child(
            "/",
            Node::new_file("outer", FileContent::from_bytes(b"outer".to_vec())),
        )
        .unwrap();
    commit_session(&mut medium, &mut image, &WriteOptions::default(), &bus).unwrap();

    let drive = medium.take_drive().unwrap();
    let mut medium = classify(drive, &ClassifyOptions::default(), bus.clone());
    let mut builder = PlainIso9660Builder;
    let mut image = load_image(
        &mut medium,
        &ReadOptions::default(),
        None,
        &mut builder,
        &bus,
    )
    .unwrap();

    let dest = tempfile::tempdir().unwrap();
    let written = extract(
        &mut image,
        "/",
        dest.path(),
        &ExtractOptions::default(),
        &AbortFlag::new(),
    )
    .unwrap();
    assert_eq!(written, 2);
    assert_eq!(std::fs::read(dest.path().join("outer")).unwrap(), b"outer");
    assert_eq!(
        std::fs::read(dest.path().join("nested/inner")).unwrap(),
        b"inner"
    );
}
