//! Commit/reload round trips over file-backed media.

use std::sync::Arc;

use isodisc::{
    ClassifyOptions, DiscStatus, FileContent, FileSource, Image, MessageBus, Node,
    PlainIso9660Builder, ReadOptions, WriteOptions, classify, commit_session, load_image,
};

fn quiet_bus() -> Arc<MessageBus> {
    let bus = MessageBus::new();
    bus.set_sink(Box::new(|_| {}));
    Arc::new(bus)
}

#[test]
fn blank_commit_then_grow_by_a_session() {
    let bus = quiet_bus();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("medium.iso");

    // A 1 GiB sparse file classifies as blank.
    {
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(1 << 30).unwrap();
    }
    let drive = FileSource::open(&path).unwrap();
    let mut medium = classify(Box::new(drive), &ClassifyOptions::default(), bus.clone());
    assert_eq!(medium.status(), DiscStatus::Blank);

    // First session: one file /hello.
    let mut image = Image::new_blank(&ReadOptions::default());
    image
        .tree
        .add_child(
            "/",
            Node::new_file("hello", FileContent::from_bytes(b"Hi\n".to_vec())),
        )
        .unwrap();
    let outcome = commit_session(&mut medium, &mut image, &WriteOptions::default(), &bus).unwrap();
    assert_eq!(outcome.start_lba, 32);
    assert!(!image.tree.changes_pending);

    // Reload: appendable, one session at 32, content intact.
    let drive = medium.take_drive().unwrap();
    let mut medium = classify(drive, &ClassifyOptions::default(), bus.clone());
    assert_eq!(medium.status(), DiscStatus::Appendable);
    assert_eq!(medium.msc1().unwrap(), 32);
    let toc = medium.toc();
    assert_eq!(toc.session_count(), 1);

    let mut builder = PlainIso9660Builder;
    let mut image = load_image(
        &mut medium,
        &ReadOptions::default(),
        None,
        &mut builder,
        &bus,
    )
    .unwrap();
    assert!(image.features.image_blocks >= 33);
    let content = image
        .tree
        .lookup("/hello")
        .unwrap()
        .file_content()
        .unwrap()
        .clone();
    assert_eq!(image.read_content(&content).unwrap(), b"Hi\n");

    // Second session: add /world with 4096 zero bytes.
    let first_end = image.features.image_blocks;
    image
        .tree
        .add_child(
            "/",
            Node::new_file("world", FileContent::from_bytes(vec![0u8; 4096])),
        )
        .unwrap();
    let outcome = commit_session(&mut medium, &mut image, &WriteOptions::default(), &bus).unwrap();
    assert_eq!(outcome.start_lba % 32, 0);
    assert!(outcome.start_lba >= first_end);

    // Reload again: two sessions, identical volume ids, both files
    // readable.
    let drive = medium.take_drive().unwrap();
    let mut medium = classify(drive, &ClassifyOptions::default(), bus.clone());
    let toc = medium.toc();
    assert_eq!(toc.session_count(), 2);
    let volids: Vec<_> = toc.entries().map(|e| e.volid.clone()).collect();
    assert_eq!(volids[0], volids[1]);
    assert!(toc.total_sectors() >= first_end);

    let mut image = load_image(
        &mut medium,
        &ReadOptions::default(),
        None,
        &mut builder,
        &bus,
    )
    .unwrap();
    assert!(image.features.image_blocks >= first_end);
    let hello = image
        .tree
        .lookup("/hello")
        .unwrap()
        .file_content()
        .unwrap()
        .clone();
    assert_eq!(image.read_content(&hello).unwrap(), b"Hi\n");
    let world = image
        .tree
        .lookup("/world")
        .unwrap()
        .file_content()
        .unwrap()
        .clone();
    assert_eq!(image.read_content(&world).unwrap(), vec![0u8; 4096]);
}

#[test]
fn truncate_trims_file_backends_to_session_end() {
    let bus = quiet_bus();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trim.iso");
    {
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(64 << 20).unwrap();
    }
    let drive = FileSource::open(&path).unwrap();
    let mut medium = classify(Box::new(drive), &ClassifyOptions::default(), bus.clone());

    let mut image = Image::new_blank(&ReadOptions::default());
    image
        .tree
        .add_child(
            "/",
            Node::new_file("data", FileContent::from_bytes(vec![7u8; 10_000])),
        )
        .unwrap();
    let opts = WriteOptions {
        truncate: true,
        ..Default::default()
    };
    let outcome = commit_session(&mut medium, &mut image, &opts, &bus).unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(
        len,
        (outcome.start_lba as u64 + outcome.written_blocks as u64) * 2048
    );
}

#[test]
fn directory_hierarchies_survive_the_round_trip() {
    let bus = quiet_bus();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested.iso");
    {
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(32 << 20).unwrap();
    }
    let drive = FileSource::open(&path).unwrap();
    let mut medium = classify(Box::new(drive), &ClassifyOptions::default(), bus.clone());

    let mut image = Image::new_blank(&ReadOptions::default());
    image.tree.mkdir("/docs").unwrap();
    image.tree.mkdir("/docs/old").unwrap();
    image
        .tree
        .add_child(
            "/docs",
            Node::new_file("readme", FileContent::from_bytes(b"read me".to_vec())),
        )
        .unwrap();
    image
        .tree
        .add_child(
            "/docs/old",
            Node::new_file("v1", FileContent::from_bytes(b"ancient".to_vec())),
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

    assert!(image.tree.lookup("/docs").unwrap().is_dir());
    assert!(image.tree.lookup("/docs/old").unwrap().is_dir());
    let v1 = image
        .tree
        .lookup("/docs/old/v1")
        .unwrap()
        .file_content()
        .unwrap()
        .clone();
    assert_eq!(image.read_content(&v1).unwrap(), b"ancient");
}

#[test]
fn pending_changes_block_a_reload() {
    let bus = quiet_bus();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.iso");
    {
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(16 << 20).unwrap();
    }
    let drive = FileSource::open(&path).unwrap();
    let mut medium = classify(Box::new(drive), &ClassifyOptions::default(), bus.clone());

    let mut image = Image::new_blank(&ReadOptions::default());
    image
        .tree
        .add_child(
            "/",
            Node::new_file("x", FileContent::from_bytes(b"x".to_vec())),
        )
        .unwrap();
    commit_session(&mut medium, &mut image, &WriteOptions::default(), &bus).unwrap();

    // Mutate without committing, then try to load again.
    image.tree.mkdir("/pending").unwrap();
    assert!(image.tree.changes_pending);
    let mut builder = PlainIso9660Builder;
    let drive = medium.take_drive().unwrap();
    let mut medium = classify(drive, &ClassifyOptions::default(), bus.clone());
    let err = load_image(
        &mut medium,
        &ReadOptions::default(),
        Some(&image),
        &mut builder,
        &bus,
    )
    .unwrap_err();
    assert!(matches!(err, isodisc::Error::ChangesPending));
}
