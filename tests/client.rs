use revkv::history::{put_probe, versions, walk_back};
use revkv::server::{serve_with_shutdown, ServeOptions};
use revkv::types::{prefix_end, EventType, SortOrder, SortTarget};
use revkv::{
    Client, ClientConfig, ConnectionError, GetOptions, PutOptions, Store, StoreError,
    WatchOptions,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

struct TestServer {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(serve_with_shutdown(
            listener,
            Store::new(1),
            ServeOptions::default(),
            async move {
                let _ = stopped.await;
            },
        ));
        Self {
            addr,
            stop: Some(stop),
            task,
        }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig::new([self.addr.to_string()])
            .with_dial_timeout(Duration::from_secs(1))
            .with_request_timeout(Duration::from_secs(2))
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_put_get_round_trip() {
    let server = TestServer::start().await;
    let client = Client::connect(server.config()).await.unwrap();
    let kv = client.kv();

    let first = kv.put("fookey", "12").await.unwrap();
    let n = first.revision();
    let resp = kv.get("fookey").await.unwrap();
    let record = resp.kv().unwrap();
    assert_eq!(record.value_str().unwrap(), "12");
    assert_eq!(record.create_revision, n);
    assert_eq!(record.mod_revision, n);
    assert_eq!(record.version, 1);

    let second = kv.put("fookey", "13").await.unwrap();
    assert_eq!(second.revision(), n + 1);
    let resp = kv.get("fookey").await.unwrap();
    let record = resp.kv().unwrap();
    assert_eq!(record.value_str().unwrap(), "13");
    assert_eq!(record.mod_revision, n + 1);
    assert_eq!(record.create_revision, n);
    assert_eq!(record.version, 2);

    // Historical reads are stable
    let old = kv.get_at_revision("fookey", n).await.unwrap();
    assert_eq!(old.kv().unwrap().value, b"12");

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_missing_key_and_absent_delete() {
    let server = TestServer::start().await;
    let client = Client::connect(server.config()).await.unwrap();
    let kv = client.kv();

    assert!(kv.get("never-written").await.unwrap().is_empty());

    kv.put("key1", "v").await.unwrap();
    assert_eq!(kv.delete("key1").await.unwrap().deleted, 1);
    assert!(kv.get("key1").await.unwrap().is_empty());

    let resp = kv.delete("key1").await.unwrap();
    assert_eq!(resp.deleted, 0);

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_prefix_get_and_delete() {
    let server = TestServer::start().await;
    let client = Client::connect(server.config()).await.unwrap();
    let kv = client.kv();

    kv.put("fookey", "12").await.unwrap();
    kv.put("fooNew", "13").await.unwrap();
    kv.put("bar", "14").await.unwrap();

    let resp = kv.get_with_prefix("foo").await.unwrap();
    let pairs: Vec<(String, String)> = resp
        .kvs
        .iter()
        .map(|kv| {
            (
                kv.key_str().unwrap().to_string(),
                kv.value_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("fooNew".to_string(), "13".to_string()),
            ("fookey".to_string(), "12".to_string()),
        ]
    );

    let deleted = kv.delete_with_prefix("foo").await.unwrap();
    assert_eq!(deleted.deleted, 2);
    assert!(kv.get_with_prefix("foo").await.unwrap().is_empty());
    assert!(!kv.get("bar").await.unwrap().is_empty());

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_errors_cross_the_wire() {
    let server = TestServer::start().await;
    let client = Client::connect(server.config()).await.unwrap();
    let kv = client.kv();

    let r1 = kv.put("key1", "v1").await.unwrap().revision();
    kv.put("key1", "v2").await.unwrap();
    let r3 = kv.put("key1", "v3").await.unwrap().revision();

    let err = kv.get_at_revision("key1", r3 + 100).await.unwrap_err();
    assert!(matches!(err, StoreError::FutureRevision { .. }));

    kv.compact(r3).await.unwrap();
    let err = kv.get_at_revision("key1", r1).await.unwrap_err();
    assert!(matches!(err, StoreError::Compacted { .. }));

    let err = kv
        .put_with_options("key2", "v", PutOptions::new().with_lease(999))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::LeaseNotFound(999));

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_pagination() {
    let server = TestServer::start().await;
    let client = Client::connect(server.config()).await.unwrap();
    let kv = client.kv();

    for i in 0..10 {
        kv.put(format!("key_{i:02}"), format!("value_{i}"))
            .await
            .unwrap();
    }

    let mut pages = 0;
    let mut seen = Vec::new();
    let mut from = b"key_".to_vec();
    loop {
        let resp = kv
            .get_with_options(
                from.clone(),
                GetOptions::new()
                    .with_from_key()
                    .with_limit(3)
                    .with_sort(SortTarget::Key, SortOrder::Ascend),
            )
            .await
            .unwrap();
        pages += 1;
        seen.extend(resp.kvs.iter().map(|kv| kv.key.clone()));
        if !resp.more {
            break;
        }
        from = resp.kvs.last().unwrap().key.clone();
        from.push(0);
    }

    assert_eq!(pages, 4);
    assert_eq!(seen.len(), 10);
    assert_eq!(seen.first().unwrap(), b"key_00");
    assert_eq!(seen.last().unwrap(), b"key_09");

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_pagination_bounded_by_prefix_end() {
    let client = Client::local(Store::new(1), ClientConfig::default());
    let kv = client.kv();

    for i in 0..7 {
        kv.put(format!("key_{i:02}"), "v").await.unwrap();
    }
    // Siblings that sort after the prefix
    kv.put("kez", "x").await.unwrap();
    kv.put("lamp", "x").await.unwrap();

    let options = GetOptions::new()
        .with_range(prefix_end(b"key"))
        .with_sort(SortTarget::Key, SortOrder::Ascend)
        .with_limit(3);
    let mut seen = Vec::new();
    let mut from = b"key".to_vec();
    let mut first = true;
    loop {
        let resp = kv
            .get_with_options(from.clone(), options.clone())
            .await
            .unwrap();
        let skip = usize::from(!first);
        seen.extend(resp.kvs.iter().skip(skip).map(|kv| kv.key.clone()));
        match resp.kvs.last() {
            Some(last) if resp.more => from = last.key.clone(),
            _ => break,
        }
        first = false;
    }

    assert_eq!(seen.len(), 7);
    assert!(seen.iter().all(|key| key.starts_with(b"key")));
    assert_eq!(seen.last().unwrap(), b"key_06");
}

#[tokio::test]
async fn test_revision_walk() {
    let server = TestServer::start().await;
    let client = Client::connect(server.config()).await.unwrap();
    let kv = client.kv();

    let created = kv.put("key1", "a").await.unwrap().revision();
    kv.put("unrelated", "x").await.unwrap();
    let probe = put_probe(&kv).await.unwrap().revision();

    let walk = walk_back(&kv, b"key1", probe).await.unwrap();
    let seen: Vec<(i64, &[u8])> = walk
        .iter()
        .map(|snap| (snap.revision, snap.kv.value.as_slice()))
        .collect();
    assert_eq!(
        seen,
        vec![
            (probe, b"444".as_slice()),
            (probe - 1, b"a".as_slice()),
            (created, b"a".as_slice()),
        ]
    );

    let all = versions(&kv, b"key1").await.unwrap();
    let values: Vec<&[u8]> = all.iter().map(|kv| kv.value.as_slice()).collect();
    assert_eq!(values, vec![b"444".as_slice(), b"a".as_slice()]);

    assert!(versions(&kv, b"missing").await.unwrap().is_empty());

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_revision_walk_stops_at_compaction() {
    let server = TestServer::start().await;
    let client = Client::connect(server.config()).await.unwrap();
    let kv = client.kv();

    kv.put("key1", "a").await.unwrap();
    kv.put("key1", "b").await.unwrap();
    let head = kv.put("key1", "c").await.unwrap().revision();
    kv.compact(head - 1).await.unwrap();

    let walk = walk_back(&kv, b"key1", head).await.unwrap();
    assert_eq!(walk.len(), 2);
    assert_eq!(versions(&kv, b"key1").await.unwrap().len(), 2);

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_watch_and_cancel() {
    let server = TestServer::start().await;
    let client = Client::connect(server.config()).await.unwrap();
    let kv = client.kv();

    let (watcher, mut stream) = client
        .watch("foo", WatchOptions::new().with_prefix())
        .await
        .unwrap();

    kv.put("foo/a", "1").await.unwrap();
    kv.put("other", "x").await.unwrap();
    kv.put("foo/b", "2").await.unwrap();
    kv.delete("foo/a").await.unwrap();

    let mut events = Vec::new();
    while events.len() < 3 {
        let resp = timeout(Duration::from_secs(5), stream.message())
            .await
            .expect("watch timed out")
            .unwrap()
            .unwrap();
        events.extend(resp.events);
    }
    let summary: Vec<(EventType, String)> = events
        .iter()
        .map(|e| (e.kind, e.kv.key_str().unwrap().to_string()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (EventType::Put, "foo/a".to_string()),
            (EventType::Put, "foo/b".to_string()),
            (EventType::Delete, "foo/a".to_string()),
        ]
    );
    assert!(events
        .windows(2)
        .all(|w| w[0].kv.mod_revision < w[1].kv.mod_revision));

    watcher.cancel().await;
    assert!(stream.message().await.unwrap().is_none());

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_watch_replays_from_start_revision() {
    let server = TestServer::start().await;
    let client = Client::connect(server.config()).await.unwrap();
    let kv = client.kv();

    let start = kv.put("key1", "a").await.unwrap().revision();
    kv.put("key1", "b").await.unwrap();

    let (watcher, mut stream) = client
        .watch("key1", WatchOptions::new().with_start_revision(start))
        .await
        .unwrap();
    let resp = timeout(Duration::from_secs(5), stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let values: Vec<&[u8]> = resp.events.iter().map(|e| e.kv.value.as_slice()).collect();
    assert_eq!(values, vec![b"a".as_slice(), b"b".as_slice()]);

    watcher.cancel().await;
    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_lease_expiry() {
    let server = TestServer::start().await;
    let client = Client::connect(server.config()).await.unwrap();
    let kv = client.kv();
    let lease = client.lease();

    let granted = lease.grant(1).await.unwrap();
    kv.put_with_options("ephemeral", "v", PutOptions::new().with_lease(granted.id))
        .await
        .unwrap();
    assert_eq!(
        kv.get("ephemeral").await.unwrap().kv().unwrap().lease,
        Some(granted.id)
    );

    sleep(Duration::from_millis(2_000)).await;
    assert!(kv.get("ephemeral").await.unwrap().is_empty());
    assert_eq!(
        lease.keep_alive(granted.id).await.unwrap_err(),
        StoreError::LeaseNotFound(granted.id)
    );

    let second = lease.grant_with_id(60, 100).await.unwrap();
    assert_eq!(second.id, 100);
    kv.put_with_options("held", "v", PutOptions::new().with_lease(100))
        .await
        .unwrap();
    assert_eq!(lease.keep_alive(100).await.unwrap().ttl, 60);
    lease.revoke(100).await.unwrap();
    assert!(kv.get("held").await.unwrap().is_empty());

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_connect_failures() {
    let config = ClientConfig::new(["127.0.0.1:1"]).with_dial_timeout(Duration::from_millis(200));
    let err = Client::connect(config).await.err().unwrap();
    assert!(matches!(err, ConnectionError::Unreachable { .. }));

    let config = ClientConfig::new(Vec::<String>::new());
    let err = Client::connect(config).await.err().unwrap();
    assert_eq!(err, ConnectionError::NoEndpoints);
}

#[tokio::test]
async fn test_connect_skips_dead_endpoint() {
    let server = TestServer::start().await;
    let config = ClientConfig::new(["127.0.0.1:1".to_string(), server.addr.to_string()])
        .with_dial_timeout(Duration::from_millis(500));
    let client = Client::connect(config).await.unwrap();
    client.kv().put("key1", "v").await.unwrap();
    client.close();
    server.stop().await;
}

#[tokio::test]
async fn test_local_client() {
    let store = Store::new(1);
    let client = Client::local(store.clone(), ClientConfig::default());
    let kv = client.kv();

    let rev = kv.put("key1", "v1").await.unwrap().revision();
    assert_eq!(store.read().revision(), rev);
    assert_eq!(kv.get("key1").await.unwrap().kv().unwrap().value, b"v1");

    let (watcher, mut stream) = client.watch("key1", WatchOptions::new()).await.unwrap();
    kv.put("key1", "v2").await.unwrap();
    let resp = timeout(Duration::from_secs(5), stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(resp.events[0].kv.value, b"v2");
    watcher.cancel().await;

    // Closing the client ends watches that were never cancelled
    let (_watcher, mut stream) = client.watch("key1", WatchOptions::new()).await.unwrap();
    client.close();
    let ended = timeout(Duration::from_secs(5), stream.message()).await.unwrap();
    assert!(ended.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_with_unread_backlog() {
    let store = Store::new(1);
    let client = Client::local(store, ClientConfig::default());
    let kv = client.kv();

    let (watcher, _stream) = client
        .watch("backlog/", WatchOptions::new().with_prefix())
        .await
        .unwrap();
    // More batches than the stream buffers, none of them read
    for i in 0..80 {
        kv.put(format!("backlog/{i:02}"), "v").await.unwrap();
        sleep(Duration::from_millis(5)).await;
    }

    assert!(timeout(Duration::from_secs(3), watcher.cancel()).await.is_ok());
}
