use revkv::history::{put_probe, versions, walk_back};
use revkv::types::{prefix_end, KeyValue, SortOrder, SortTarget};
use revkv::{Client, GetOptions, PutOptions, StoreError, WatchOptions};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Print a failed step and carry on with the rest of the demo
fn report<T>(step: &str, result: Result<T, StoreError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            println!("{step} failed: {err}");
            warn!("{step} failed: {err}");
            None
        }
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn print_record(kv: &KeyValue) {
    println!("Key: {}", text(&kv.key));
    println!("Value: {}", text(&kv.value));
    println!("Create Revision: {}", kv.create_revision);
    println!("Mod Revision: {}", kv.mod_revision);
    println!("Version: {}", kv.version);
}

pub async fn tour(client: &Client) {
    let kv = client.kv();

    if let Some(put) = report("Create One", kv.put("fookey", "12").await) {
        println!("\nCreate One Done");
        println!("Revision Number: {}", put.revision());
    }

    if let Some(got) = report("Get One", kv.get("fookey").await) {
        println!("\nGet One Done");
        match got.kv() {
            Some(record) => print_record(record),
            None => println!("No 'fookey'"),
        }
    }

    report("Create fooNew", kv.put("fooNew", "13").await);
    if let Some(got) = report("Get Multiple", kv.get_with_prefix("foo").await) {
        println!("\nGet Multiple Done");
        for item in &got.kvs {
            println!("{} {}", text(&item.key), text(&item.value));
        }
    }

    println!("\nTest Revision");
    let Some(probe) = report("Put key1", put_probe(&kv).await) else {
        return;
    };
    if let Some(walk) = report("Revision walk", walk_back(&kv, b"key1", probe.revision()).await) {
        for snap in &walk {
            println!("*** Revision Number: {}", snap.revision);
            println!("Value: {}", text(&snap.kv.value));
            println!(
                "Create Rev: {} Mod Rev: {}",
                snap.kv.create_revision, snap.kv.mod_revision
            );
            println!("Key Version: {}\n", snap.kv.version);
        }
    }
    if let Some(all) = report("Versions", versions(&kv, b"key1").await) {
        println!("key1 has {} version(s) since it was created", all.len());
    }

    report("Delete fookey", kv.delete("fookey").await);
    if let Some(deleted) = report("Delete prefix foo", kv.delete_with_prefix("foo").await) {
        println!("Deleted {} key(s) with prefix foo", deleted.deleted);
    }
}

pub async fn single_value(client: &Client) {
    println!("*** GetSingleValueDemo()");
    let kv = client.kv();
    report("Clear keys", kv.delete_with_prefix("key").await);

    let Some(put) = report("Put key", kv.put("key", "444").await) else {
        return;
    };
    let rev = put.revision();
    println!("Revision: {rev}");

    if let Some(got) = report("Get key", kv.get("key").await) {
        if let Some(record) = got.kv() {
            println!("Value: {} Revision: {}", text(&record.value), got.revision());
        }
    }

    report("Put key", kv.put("key", "555").await);
    if let Some(got) = report("Get key", kv.get("key").await) {
        if let Some(record) = got.kv() {
            println!("Value: {} Revision: {}", text(&record.value), got.revision());
        }
    }

    if let Some(got) = report("Get key at revision", kv.get_at_revision("key", rev).await) {
        if let Some(record) = got.kv() {
            println!("Value: {} Revision: {}", text(&record.value), got.revision());
        }
    }
}

pub async fn pagination(client: &Client) {
    println!("*** GetMultipleValuesWithPaginationDemo()");
    let kv = client.kv();
    report("Clear keys", kv.delete_with_prefix("key").await);

    for i in 0..50 {
        report("Put", kv.put(format!("key_{i:02}"), i.to_string()).await);
    }

    // Every page stays below the end of the `key` prefix
    let options = GetOptions::new()
        .with_range(prefix_end(b"key"))
        .with_sort(SortTarget::Key, SortOrder::Ascend)
        .with_limit(10);
    let mut from = b"key".to_vec();
    let mut page = 1;
    loop {
        let Some(got) = report(
            "Get page",
            kv.get_with_options(from.clone(), options.clone()).await,
        ) else {
            return;
        };
        println!("--- Page {page} ---");
        // Later pages start at the last key of the previous page
        let skip = usize::from(page > 1);
        for item in got.kvs.iter().skip(skip) {
            println!("{} {}", text(&item.key), text(&item.value));
        }
        match got.kvs.last() {
            Some(last) if got.more => from = last.key.clone(),
            _ => return,
        }
        page += 1;
    }
}

pub async fn watch(client: &Client) {
    println!("*** WatchDemo()");
    let kv = client.kv();
    report("Clear keys", kv.delete_with_prefix("key").await);

    let Some((watcher, mut stream)) = report(
        "Watch",
        client.watch("key", WatchOptions::new().with_prefix()).await,
    ) else {
        return;
    };
    let printer = tokio::spawn(async move {
        loop {
            match stream.message().await {
                Ok(Some(resp)) => {
                    for event in &resp.events {
                        println!(
                            "{} {:?} : {:?}",
                            event.kind,
                            text(&event.kv.key),
                            text(&event.kv.value)
                        );
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    println!("Watch failed: {err}");
                    break;
                }
            }
        }
        println!("Done watching.");
    });

    for i in 0..10 {
        report("Put", kv.put(format!("key_{i:02}"), i.to_string()).await);
    }

    // Give the watch time to deliver the PUT events
    sleep(Duration::from_secs(1)).await;
    watcher.cancel().await;
    let _ = printer.await;

    // Nobody is watching these
    for i in 10..20 {
        report("Put", kv.put(format!("key_{i:02}"), i.to_string()).await);
    }
}

pub async fn lease(client: &Client) {
    println!("*** LeaseDemo()");
    let kv = client.kv();
    report("Clear keys", kv.delete_with_prefix("key").await);

    if let Some(got) = report("Get key", kv.get("key").await) {
        if got.is_empty() {
            println!("No 'key'");
        }
    }

    let Some(lease) = report("Grant lease", client.lease().grant(1).await) else {
        return;
    };
    report(
        "Put key",
        kv.put_with_options("key", "value", PutOptions::new().with_lease(lease.id))
            .await,
    );

    if let Some(got) = report("Get key", kv.get("key").await) {
        if got.kvs.len() == 1 {
            println!("Found 'key'");
        }
    }

    // Let the TTL expire
    sleep(Duration::from_secs(3)).await;

    if let Some(got) = report("Get key", kv.get("key").await) {
        if got.is_empty() {
            println!("No more 'key'");
        }
    }
}
