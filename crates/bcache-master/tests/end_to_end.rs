//! End-to-end scenario 3 (SPEC_FULL §8): master handover once the holder
//! stops refreshing its lease past expiry.

use std::time::Duration;

use bcache_hash::BlobPath;
use bcache_master::{MasterElection, Role};
use bcache_storage::{LocalFsAdapter, ObjectPath};
use tempfile::TempDir;

fn lease_path() -> ObjectPath {
    BlobPath {
        container: "bcache".into(),
        folder: "master".into(),
        relative_path: "lease.json".into(),
    }
}

#[test]
fn stale_lease_hands_over_to_a_new_node() {
    let dir = TempDir::new().unwrap();
    let lease_expiry_time = Duration::from_millis(200);

    let adapter_a = LocalFsAdapter::new(dir.path()).unwrap();
    let election_a = MasterElection::new(adapter_a, lease_path(), "node-a", lease_expiry_time);
    let (master, role, _) = election_a.get_role(true, false).unwrap();
    assert_eq!(master.as_deref(), Some("node-a"));
    assert_eq!(role, Role::Master);

    // node-a stops refreshing; wait past lease_expiry_time.
    std::thread::sleep(lease_expiry_time + Duration::from_millis(200));

    let adapter_b = LocalFsAdapter::new(dir.path()).unwrap();
    let election_b = MasterElection::new(adapter_b, lease_path(), "node-b", lease_expiry_time);
    let (master, role, _) = election_b.get_role(true, false).unwrap();
    assert_eq!(master.as_deref(), Some("node-b"));
    assert_eq!(role, Role::Master);

    // node-a, still not refreshing, now observes node-b as master.
    let (master, role, _) = election_a.get_role(true, false).unwrap();
    assert_eq!(master.as_deref(), Some("node-b"));
    assert_eq!(role, Role::Worker);
}
