//! Write-planner decisions against mocked media.

use std::sync::{Arc, Mutex};

use isodisc::{
    ClassifyOptions, DiscStatus, Image, MemSource, MessageBus, ReadOptions, Severity,
    SourceRole, WriteOptions, classify, plan_write,
};
use isodisc::source::FormatStatus;

fn collecting_bus() -> (Arc<MessageBus>, Arc<Mutex<Vec<(Severity, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let bus = MessageBus::new();
    let sink_seen = seen.clone();
    bus.set_sink(Box::new(move |m| {
        sink_seen.lock().unwrap().push((m.severity, m.text.clone()))
    }));
    (Arc::new(bus), seen)
}

#[test]
fn intermediate_dvd_rw_refuses_sessions_above_zero() {
    let (bus, seen) = collecting_bus();
    let src = MemSource::new(4096)
        .with_role(SourceRole::OpticalMmc)
        .with_profile(0x13)
        .with_status(DiscStatus::Blank)
        .with_format_status(FormatStatus::Unknown);
    let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus.clone());
    assert!(medium.is_intermediate_dvd_rw());
    assert_eq!(medium.nwa, 0);

    // A session demanded above block 0 must be refused.
    let opts = WriteOptions {
        start_byte: Some(64 * 2048),
        ..Default::default()
    };
    let err = plan_write(&mut medium, &opts, &bus).unwrap_err();
    assert!(matches!(err, isodisc::Error::BadWriteMode(_)));
    assert_eq!(medium.wrote_well(), Some(false));

    let seen = seen.lock().unwrap();
    assert!(
        seen.iter()
            .any(|(sev, text)| *sev == Severity::Failure
                && text.contains("insufficiently formatted"))
    );
    assert!(
        seen.iter()
            .any(|(sev, text)| *sev == Severity::Hint && text.contains("deformat"))
    );
}

#[test]
fn first_session_on_intermediate_dvd_rw_starts_at_zero() {
    let (bus, _) = collecting_bus();
    let src = MemSource::new(4096)
        .with_role(SourceRole::OpticalMmc)
        .with_profile(0x13)
        .with_status(DiscStatus::Blank)
        .with_format_status(FormatStatus::Unknown);
    let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus.clone());

    let plan = plan_write(&mut medium, &WriteOptions::default(), &bus).unwrap();
    assert_eq!(plan.start_lba, 0);
    assert!(!plan.multi_session);
}

#[test]
fn blank_overwriteable_media_start_at_the_header_offset() {
    let (bus, _) = collecting_bus();
    let src = MemSource::new(4096);
    let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus.clone());
    assert_eq!(medium.status(), DiscStatus::Blank);

    let plan = plan_write(&mut medium, &WriteOptions::default(), &bus).unwrap();
    assert_eq!(plan.start_lba, 32);
    assert!(plan.emul_toc);
}

#[test]
fn explicit_start_bytes_round_up_to_session_alignment() {
    let (bus, _) = collecting_bus();
    let src = MemSource::new(8192);
    let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus.clone());

    let opts = WriteOptions {
        start_byte: Some(100 * 2048),
        ..Default::default()
    };
    let plan = plan_write(&mut medium, &opts, &bus).unwrap();
    assert_eq!(plan.start_lba, 128);
}

#[test]
fn msc2_override_wins_over_the_next_writable_address() {
    let (bus, _) = collecting_bus();
    let src = MemSource::new(8192);
    let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus.clone());
    medium.set_fabricated_msc2(2048);

    let plan = plan_write(&mut medium, &WriteOptions::default(), &bus).unwrap();
    assert_eq!(plan.start_lba, 2048);
}

#[test]
fn commit_to_memory_medium_round_trips() {
    use isodisc::{FileContent, Node, PlainIso9660Builder, commit_session, load_image};

    let (bus, _) = collecting_bus();
    let src = MemSource::new(8192);
    let mut medium = classify(Box::new(src), &ClassifyOptions::default(), bus.clone());

    let mut image = Image::new_blank(&ReadOptions::default());
    image
        .tree
        .add_child(
            "/",
            Node::new_file("note", FileContent::from_bytes(b"memory lane".to_vec())),
        )
        .unwrap();
    commit_session(&mut medium, &mut image, &WriteOptions::default(), &bus).unwrap();

    let drive = medium.take_drive().unwrap();
    let mut medium = classify(drive, &ClassifyOptions::default(), bus.clone());
    assert_eq!(medium.status(), DiscStatus::Appendable);

    let mut builder = PlainIso9660Builder;
    let mut image = load_image(
        &mut medium,
        &ReadOptions::default(),
        None,
        &mut builder,
        &bus,
    )
    .unwrap();
    let note = image
        .tree
        .lookup("/note")
        .unwrap()
        .file_content()
        .unwrap()
        .clone();
    assert_eq!(image.read_content(&note).unwrap(), b"memory lane");
}
