use crate::{context, JournaledLocalStore, TieredStoreConfig, TieredStoreMgr};
use cache_lib::{DefaultPathGenerator, LocalCacheProvider, Location, Resource};
use cluster_map::ClusterMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};

const NODE_IP: &str = "10.0.0.9";

struct Harness {
    mgr: Arc<TieredStoreMgr>,
    local: Arc<JournaledLocalStore>,
    owner_map: Arc<ClusterMap<String>>,
    local_files: Arc<ClusterMap<Resource>>,
    shared_root: PathBuf,
    _local_dir: TempDir,
    _shared_dir: TempDir,
}

fn mk_harness(name: &str) -> Harness {
    mk_harness_ttl(name, None)
}

fn mk_harness_ttl(name: &str, local_ttl: Option<Duration>) -> Harness {
    let local_dir = tempdir().unwrap();
    let shared_dir = tempdir().unwrap();
    let local = Arc::new(
        JournaledLocalStore::new(
            local_dir.path().join("local"),
            Arc::new(DefaultPathGenerator),
        )
        .unwrap(),
    );
    let owner_map: Arc<ClusterMap<String>> = ClusterMap::new(&format!("{}-owners", name));
    let local_files: Arc<ClusterMap<Resource>> = match local_ttl {
        Some(ttl) => ClusterMap::with_default_ttl(&format!("{}-local-files", name), ttl),
        None => ClusterMap::new(&format!("{}-local-files", name)),
    };
    let config = TieredStoreConfig {
        shared_root: Some(shared_dir.path().join("shared")),
        node_ip: Some(NODE_IP.to_string()),
        lock_wait_secs: Some(30),
        expiry_sweep_millis: Some(20),
    };
    let mgr = TieredStoreMgr::open(
        local.clone() as Arc<dyn LocalCacheProvider>,
        Arc::new(DefaultPathGenerator),
        owner_map.clone(),
        local_files.clone(),
        config,
    )
    .unwrap();
    let shared_root = mgr.shared_root().to_path_buf();
    Harness {
        mgr,
        local,
        owner_map,
        local_files,
        shared_root,
        _local_dir: local_dir,
        _shared_dir: shared_dir,
    }
}

fn res(path: &str) -> Resource {
    Resource::new(Arc::new(Location::new("central")), path)
}

fn shared_file(h: &Harness, r: &Resource) -> PathBuf {
    h.shared_root.join("central").join(r.path())
}

async fn write_and_close(h: &Harness, r: &Resource, bytes: &[u8]) {
    let mut out = h.mgr.open_output(r).await.unwrap();
    out.write_all(bytes).await.unwrap();
    out.shutdown().await.unwrap();
}

async fn read_local(h: &Harness, r: &Resource) -> Vec<u8> {
    let mut input = h.local.open_input(r).await.unwrap();
    let mut buf = Vec::new();
    input.read_to_end(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn test_write_close_mirrors_both_tiers() {
    let h = mk_harness("mirror");
    let r = res("org/foo/foo-1.0.jar");
    let key = h.mgr.key_for(&r).unwrap();

    write_and_close(&h, &r, b"HELLO").await;

    assert_eq!(read_local(&h, &r).await, b"HELLO");
    assert_eq!(tokio::fs::read(shared_file(&h, &r)).await.unwrap(), b"HELLO");
    assert_eq!(h.owner_map.get(&key).unwrap(), NODE_IP);

    // The outermost close committed exactly once and left nothing locked.
    assert_eq!(h.owner_map.commit_count(), 1);
    assert!(!h.owner_map.is_locked(&key));
    assert_eq!(context::current().tx_files(), 0);
}

#[tokio::test]
async fn test_write_delete_then_gone() {
    let h = mk_harness("write-delete");
    let r = res("org/foo/foo-1.0.jar");
    let key = h.mgr.key_for(&r).unwrap();

    write_and_close(&h, &r, b"HELLO").await;
    assert!(h.mgr.delete(&r).await.unwrap());

    assert!(!h.mgr.exists(&r).await);
    assert!(!h.local.exists(&r).await);
    assert!(tokio::fs::metadata(shared_file(&h, &r)).await.is_err());
    assert!(h.owner_map.get(&key).is_none());
    assert!(!h.owner_map.is_locked(&key));
}

#[tokio::test]
async fn test_delete_refuses_while_stream_open() {
    let h = mk_harness("delete-vs-write");
    let r = res("org/foo/foo-1.0.jar");

    let mut out = h.mgr.open_output(&r).await.unwrap();
    out.write_all(b"partial").await.unwrap();

    // The open stream holds the local write lock; deletion backs off.
    assert!(!h.mgr.delete(&r).await.unwrap());
    assert!(h.mgr.exists(&r).await);

    out.shutdown().await.unwrap();
    assert!(h.mgr.delete(&r).await.unwrap());
    assert!(!h.mgr.exists(&r).await);
}

#[tokio::test]
async fn test_nested_sibling_writes_commit_once() {
    let h = mk_harness("nested");
    let jar = res("org/foo/foo-1.0.jar");
    let sha = res("org/foo/foo-1.0.jar.sha1");
    let key = h.mgr.key_for(&jar).unwrap();
    assert_eq!(key, h.mgr.key_for(&sha).unwrap());

    let mut out_jar = h.mgr.open_output(&jar).await.unwrap();
    out_jar.write_all(b"jar-bytes").await.unwrap();

    let mut out_sha = h.mgr.open_output(&sha).await.unwrap();
    out_sha.write_all(b"sha-bytes").await.unwrap();

    // Inner close: the stacked key stays locked, no commit yet.
    out_sha.shutdown().await.unwrap();
    assert!(h.owner_map.is_locked(&key));
    assert_eq!(h.owner_map.commit_count(), 0);

    // Outermost close commits the whole batch once.
    out_jar.shutdown().await.unwrap();
    assert!(!h.owner_map.is_locked(&key));
    assert_eq!(h.owner_map.commit_count(), 1);
    assert_eq!(context::current().tx_files(), 0);

    assert_eq!(read_local(&h, &jar).await, b"jar-bytes");
    assert_eq!(read_local(&h, &sha).await, b"sha-bytes");
}

#[tokio::test]
async fn test_double_close_is_noop() {
    let h = mk_harness("double-close");
    let r = res("org/foo/foo-1.0.jar");
    let key = h.mgr.key_for(&r).unwrap();

    let mut out = h.mgr.open_output(&r).await.unwrap();
    out.write_all(b"HELLO").await.unwrap();
    out.shutdown().await.unwrap();
    out.shutdown().await.unwrap();

    assert!(!h.owner_map.is_locked(&key));
    assert_eq!(h.owner_map.commit_count(), 1);
    assert_eq!(read_local(&h, &r).await, b"HELLO");
}

#[tokio::test]
async fn test_miss_pull_populates_local() {
    let h = mk_harness("miss-pull");
    let r = res("org/foo/foo-1.0.jar");

    // Seed the shared tier only, as a peer node would have.
    let shared = shared_file(&h, &r);
    tokio::fs::create_dir_all(shared.parent().unwrap()).await.unwrap();
    tokio::fs::write(&shared, b"SHARED-DATA").await.unwrap();
    assert!(!h.local.exists(&r).await);

    let mut input = h.mgr.open_input(&r).await.unwrap().expect("readable");
    let mut buf = Vec::new();
    input.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"SHARED-DATA");
    drop(input);

    assert!(h.local.exists(&r).await);

    // The pull's epilogue released the cluster lock and recorded the local
    // copy for expiration tracking.
    let key = h.mgr.key_for(&r).unwrap();
    for _ in 0..200u32 {
        if !h.owner_map.is_locked(&key) && h.local_files.get(r.path()).is_some() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("pull epilogue did not settle");
}

#[tokio::test]
async fn test_double_miss_returns_none() {
    let h = mk_harness("double-miss");
    let r = res("org/foo/absent.jar");

    let result = timeout(Duration::from_secs(5), h.mgr.open_input(&r))
        .await
        .expect("bounded");
    assert!(result.unwrap().is_none());
}

#[tokio::test]
async fn test_copy_and_reverse_copy_no_deadlock() {
    let h = mk_harness("copy");
    let a = res("grp-x/a.jar");
    let b = res("grp-y/b.jar");

    for (r, bytes) in [(&a, b"aaaa"), (&b, b"bbbb")] {
        let shared = shared_file(&h, r);
        tokio::fs::create_dir_all(shared.parent().unwrap()).await.unwrap();
        tokio::fs::write(&shared, bytes).await.unwrap();
    }

    let mgr1 = h.mgr.clone();
    let mgr2 = h.mgr.clone();
    let (fa, fb) = (a.clone(), b.clone());
    let (ra, rb) = (a.clone(), b.clone());
    let t1 = tokio::spawn(async move { mgr1.copy(&fa, &fb).await });
    let t2 = tokio::spawn(async move { mgr2.copy(&rb, &ra).await });

    let (r1, r2) = timeout(Duration::from_secs(10), async {
        (t1.await.unwrap(), t2.await.unwrap())
    })
    .await
    .expect("copies must not deadlock");
    r1.unwrap();
    r2.unwrap();

    assert!(tokio::fs::metadata(shared_file(&h, &a)).await.is_ok());
    assert!(tokio::fs::metadata(shared_file(&h, &b)).await.is_ok());
    let to_key = h.mgr.key_for(&b).unwrap();
    assert!(h.owner_map.get(&to_key).is_some());
}

#[tokio::test]
async fn test_expired_local_entry_deleted() {
    let h = mk_harness_ttl("expire", Some(Duration::from_millis(50)));
    let r = res("org/foo/foo-1.0.jar");

    write_and_close(&h, &r, b"HELLO").await;
    assert!(h.local.exists(&r).await);

    for _ in 0..200u32 {
        if !h.local.exists(&r).await {
            // The shared copy is untouched by local expiration.
            assert!(tokio::fs::metadata(shared_file(&h, &r)).await.is_ok());
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("local copy not expired");
}

#[tokio::test]
async fn test_lock_status_tracks_open_stream() {
    let h = mk_harness("lock-status");
    let r = res("org/foo/foo-1.0.jar");

    assert!(!h.mgr.is_write_locked(&r).await.unwrap());

    let mut out = h.mgr.open_output(&r).await.unwrap();
    out.write_all(b"HELLO").await.unwrap();
    assert!(h.mgr.is_write_locked(&r).await.unwrap());

    out.shutdown().await.unwrap();
    assert!(!h.mgr.is_write_locked(&r).await.unwrap());
}

#[tokio::test]
async fn test_wait_for_write_unlock() {
    let h = mk_harness("wait-unlock");
    let r = res("org/foo/foo-1.0.jar");

    let mgr = h.mgr.clone();
    let held = r.clone();
    let writer = tokio::spawn(async move {
        let mut out = mgr.open_output(&held).await.unwrap();
        out.write_all(b"HELLO").await.unwrap();
        sleep(Duration::from_millis(150)).await;
        out.shutdown().await.unwrap();
    });

    sleep(Duration::from_millis(50)).await;
    timeout(Duration::from_secs(5), h.mgr.wait_for_write_unlock(&r))
        .await
        .expect("bounded")
        .unwrap();
    assert!(!h.mgr.is_write_locked(&r).await.unwrap());
    writer.await.unwrap();
}

#[tokio::test]
async fn test_stats_read_the_shared_tier() {
    let h = mk_harness("stats");
    let r = res("org/foo/foo-1.0.jar");

    // Missing files never error; they are just zero.
    assert_eq!(h.mgr.length(&r).await, 0);
    assert_eq!(h.mgr.last_modified(&r).await, 0);

    write_and_close(&h, &r, b"HELLO").await;
    assert!(h.mgr.exists(&r).await);
    assert!(h.mgr.is_file(&r));
    assert_eq!(h.mgr.length(&r).await, 5);
    assert!(h.mgr.last_modified(&r).await > 0);

    let dir = res("org/foo");
    assert!(h.mgr.is_directory(&dir));
    let names = h.mgr.list(&dir).await;
    assert!(names.contains(&"foo-1.0.jar".to_string()));
}

#[tokio::test]
async fn test_mkdirs_and_create_file() {
    let h = mk_harness("mkdirs");
    let dir = res("org/new/tree");
    let file = res("org/new/tree/marker.txt");

    h.mgr.mkdirs(&dir).await.unwrap();
    assert!(shared_file(&h, &dir).is_dir());

    h.mgr.create_file(&file).await.unwrap();
    assert!(shared_file(&h, &file).is_file());

    // Directory bookkeeping never commits anything on the map.
    assert_eq!(h.owner_map.commit_count(), 0);
    let key = h.mgr.key_for(&file).unwrap();
    assert!(!h.owner_map.is_locked(&key));
}

#[tokio::test]
async fn test_alt_storage_location_overrides_read_path() {
    let h = mk_harness("alt-storage");
    let alt = tempdir().unwrap();
    let loc = Arc::new(
        Location::new("central")
            .with_attribute(cache_lib::ATTR_ALT_STORAGE_LOCATION, alt.path().to_string_lossy()),
    );
    let r = Resource::new(loc, "org/foo/foo-1.0.jar");

    let path = h.mgr.file_path(&r);
    assert!(path.starts_with(alt.path()));

    let plain = res("org/foo/foo-1.0.jar");
    assert!(h.mgr.file_path(&plain).starts_with(&h.shared_root));
}

#[tokio::test]
async fn test_cleanup_releases_leaked_stream() {
    let h = mk_harness("cleanup");
    let r = res("org/foo/foo-1.0.jar");
    let key = h.mgr.key_for(&r).unwrap();

    let mut out = h.mgr.open_output(&r).await.unwrap();
    out.write_all(b"HELLO").await.unwrap();
    assert!(h.owner_map.is_locked(&key));

    // The stream is forgotten without a close; context cleanup frees the
    // cluster lock by rolling back.
    std::mem::forget(out);
    h.mgr.cleanup_current_context().await;

    assert!(!h.owner_map.is_locked(&key));
    assert_eq!(h.owner_map.commit_count(), 0);
}
