//! End-to-end scenario 5 (SPEC_FULL §8): a remote blob whose stored bytes
//! don't match the hash it's advertised under.

use std::sync::{Arc, Mutex};

use bcache_events::Event;
use bcache_hash::ContentHash;
use bcache_remote::{EventSink, PlaceOutcome, RemoteCasSession};
use bcache_storage::LocalFsAdapter;
use tempfile::TempDir;

fn session_with_sink(
    dir: &TempDir,
    events: Arc<Mutex<Vec<Event>>>,
) -> RemoteCasSession<LocalFsAdapter> {
    let adapter = LocalFsAdapter::new(dir.path()).unwrap();
    let sink: Box<dyn EventSink> = Box::new(move |e: Event| events.lock().unwrap().push(e));
    RemoteCasSession::new(adapter).with_sink(sink)
}

#[test]
fn corrupted_remote_blob_is_reported_not_found_and_removed() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let session = session_with_sink(&dir, events.clone());

    // Store real bytes under a hash that does not match them, simulating a
    // remote blob that has been corrupted (or mislabeled) after upload.
    let data = vec![7u8; 2048];
    let wrong_hash = ContentHash::from_blake3(blake3::hash(b"not the real content"));
    session.put_bytes(&wrong_hash, &data).unwrap();
    events.lock().unwrap().clear();

    let dest = dir.path().join("placed.bin");
    let (outcome, _timings) = session
        .place_file(&wrong_hash, &dest, data.len() as u64)
        .unwrap();

    assert_eq!(outcome, PlaceOutcome::NotPlacedContentNotFound);
    assert!(!dest.exists());

    let recorded = events.lock().unwrap();
    assert!(
        !recorded.iter().any(|e| matches!(e, Event::Touch { .. })),
        "corrupted blob must not emit Touch: {recorded:?}"
    );
    assert!(
        recorded.iter().any(|e| matches!(e, Event::Delete { .. })),
        "corrupted blob must emit Delete: {recorded:?}"
    );
}

#[test]
fn genuinely_missing_blob_also_emits_delete_not_touch() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let session = session_with_sink(&dir, events.clone());

    let hash = ContentHash::from_blake3(blake3::hash(b"never uploaded"));
    let dest = dir.path().join("missing.bin");
    let (outcome, _) = session.place_file(&hash, &dest, 64).unwrap();

    assert_eq!(outcome, PlaceOutcome::NotPlacedContentNotFound);
    let recorded = events.lock().unwrap();
    assert!(matches!(recorded.as_slice(), [Event::Delete { .. }]));
}
