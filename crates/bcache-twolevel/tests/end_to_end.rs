//! End-to-end scenarios 1 and 6 (SPEC_FULL §8): Local-CAS read-through and
//! put-after-local-existed elision of the remote replication step.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bcache_events::Event;
use bcache_local::LocalCas;
use bcache_remote::{EventSink, RemoteCasSession};
use bcache_storage::LocalFsAdapter;
use bcache_twolevel::{TwoLevelConfig, TwoLevelSession};
use tempfile::TempDir;

fn session_with_sink(
    events: Arc<Mutex<Vec<Event>>>,
    config: TwoLevelConfig,
) -> (TempDir, TempDir, TwoLevelSession<LocalFsAdapter>) {
    let local_dir = TempDir::new().unwrap();
    let remote_dir = TempDir::new().unwrap();
    let local = LocalCas::open(local_dir.path()).unwrap();
    let adapter = LocalFsAdapter::new(remote_dir.path()).unwrap();
    let sink: Box<dyn EventSink> = Box::new(move |e: Event| events.lock().unwrap().push(e));
    let remote = RemoteCasSession::new(adapter).with_sink(sink);
    let session = TwoLevelSession::new(local, remote, config);
    (local_dir, remote_dir, session)
}

#[test]
fn two_level_read_through_then_second_read_avoids_remote_traffic() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (_l, _r, session) = session_with_sink(events.clone(), TwoLevelConfig::default());

    let (hash, _) = session.remote().put_unhashed(b"remote-seeded").unwrap();
    assert!(!session.local().contains(&hash));
    events.lock().unwrap().clear();

    // First read: Local CAS is empty, so this falls back to the remote and
    // promotes the content into Local CAS. Expect remote traffic.
    let (mut reader, len) = session.open_stream(&hash).unwrap().unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"remote-seeded");
    assert_eq!(len, 13);
    assert!(session.local().contains(&hash));
    assert!(!events.lock().unwrap().is_empty(), "first read must touch the remote");

    events.lock().unwrap().clear();

    // Second read: content now lives in Local CAS, so this must be served
    // without any remote round-trip at all.
    let (mut reader2, _len2) = session.open_stream(&hash).unwrap().unwrap();
    let mut buf2 = Vec::new();
    reader2.read_to_end(&mut buf2).unwrap();
    assert_eq!(buf2, b"remote-seeded");
    assert!(
        events.lock().unwrap().is_empty(),
        "second read must not generate any remote event: {:?}",
        events.lock().unwrap()
    );
}

#[test]
fn put_after_local_existed_elides_remote_put_within_ttl() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let config = TwoLevelConfig {
        skip_remote_put_if_exists_locally_for: Some(Duration::from_secs(3600)),
        ..Default::default()
    };
    let (_l, _r, session) = session_with_sink(events.clone(), config);

    let first = session.put_stream(&b"elide-me"[..]).unwrap();
    assert!(!first.existed_locally);
    assert!(
        !events.lock().unwrap().is_empty(),
        "first put must replicate to the remote"
    );

    // Repeated puts of the same content while it's still local must not
    // touch the remote again, within the configured elision window.
    for _ in 0..3 {
        events.lock().unwrap().clear();
        let repeat = session.put_stream(&b"elide-me"[..]).unwrap();
        assert!(repeat.existed_locally);
        assert_eq!(repeat.hash, first.hash);
        assert!(
            events.lock().unwrap().is_empty(),
            "repeated put within the elision window must not touch the remote: {:?}",
            events.lock().unwrap()
        );
    }
}
