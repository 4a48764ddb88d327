use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use replisync_agent::{Replica, ReplicationEvent, SqliteStore};
use replisync_core::{
    now_millis, Document, DocumentCollection, MemoryCollection, MemoryTombstoneMap, Origin,
    TombstoneMap,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as Frame;

type Peers = Arc<Mutex<Vec<(usize, mpsc::UnboundedSender<Frame>)>>>;

/// Forward every data frame from one client to all other clients.
async fn spawn_relay() -> String {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/replica", server.local_addr().unwrap());
    let peers: Peers = Arc::default();

    tokio::spawn(async move {
        let mut next_id = 0;
        while let Ok((stream, _)) = server.accept().await {
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };
            let (mut sink, mut source) = ws.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
            let id = next_id;
            next_id += 1;
            peers.lock().push((id, tx));

            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
            });

            let peers = peers.clone();
            tokio::spawn(async move {
                while let Some(Ok(frame)) = source.next().await {
                    if frame.is_text() || frame.is_binary() {
                        for (other, tx) in peers.lock().iter() {
                            if *other != id {
                                let _ = tx.send(frame.clone());
                            }
                        }
                    }
                }
                peers.lock().retain(|(other, _)| *other != id);
            });
        }
    });

    url
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

fn body(collection: &dyn DocumentCollection, id: &str) -> Option<String> {
    collection
        .get_by_id(id)
        .unwrap()
        .and_then(|doc| doc.get("owner").and_then(|v| v.as_str()).map(str::to_string))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_replicas_converge_through_a_relay() {
    let url = spawn_relay().await;

    // Replica A: in-memory collection
    let a_docs = Arc::new(MemoryCollection::new("todos"));
    let a_tombstones = Arc::new(MemoryTombstoneMap::new());
    a_docs
        .insert(Document::new("a1", 100).with("owner", "a"), Origin::Local)
        .unwrap();
    a_docs
        .insert(Document::new("shared", 200).with("owner", "a"), Origin::Local)
        .unwrap();
    a_docs
        .insert(Document::new("doomed", 50).with("owner", "a"), Origin::Local)
        .unwrap();

    // Replica B: SQLite store
    let dir = tempfile::tempdir().unwrap();
    let b_store = Arc::new(SqliteStore::open(&dir.path().join("b.db"), "todos").unwrap());
    b_store
        .insert(Document::new("b1", 110).with("owner", "b"), Origin::Local)
        .unwrap();
    b_store
        .insert(Document::new("shared", 300).with("owner", "b"), Origin::Local)
        .unwrap();
    b_store.put("doomed", 60).unwrap();

    let a = Replica::builder()
        .collection(a_docs.clone())
        .tombstones(a_tombstones.clone())
        .remote(&url)
        .chunk_size(2)
        .debounce(Duration::from_millis(10))
        .create()
        .unwrap();
    let b = Replica::builder()
        .store(b_store.clone())
        .remote(&url)
        .chunk_size(2)
        .debounce(Duration::from_millis(10))
        .jwt_auth("token-b")
        .create()
        .unwrap();
    assert_ne!(a.replica_id(), b.replica_id());

    let mut b_events = b.subscribe();
    a.connect().await;
    b.connect().await;

    // B's connect reaches A, A's ack opens B's session
    let connected = timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(ReplicationEvent::Connected) = b_events.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(connected.is_ok(), "B never completed the handshake");

    eventually("batches to converge", || {
        body(a_docs.as_ref(), "b1").as_deref() == Some("b")
            && body(b_store.as_ref(), "a1").as_deref() == Some("a")
            && body(a_docs.as_ref(), "shared").as_deref() == Some("b")
            && body(b_store.as_ref(), "shared").as_deref() == Some("b")
            && a_docs.get_by_id("doomed").unwrap().is_none()
            && b_store.get_by_id("doomed").unwrap().is_none()
    })
    .await;
    assert_eq!(a_tombstones.get("doomed").unwrap(), Some(60));

    eventually("checkpoints to advance", || {
        a.last_sync_time() > 0 && b.last_sync_time() > 0
    })
    .await;

    // Live local writes travel as standalone feeds
    let live = Document::new("live", now_millis()).with("owner", "a");
    a_docs.insert(live.clone(), Origin::Local).unwrap();
    eventually("live insert", || body(b_store.as_ref(), "live").is_some()).await;

    a_docs.remove(&live, Origin::Local).unwrap();
    eventually("live removal", || b_store.get_by_id("live").unwrap().is_none()).await;
    assert!(b_store.get("live").unwrap().is_some());

    eventually("journals to drain", || {
        a.context().journal().is_empty() && b.context().journal().is_empty()
    })
    .await;

    a.disconnect();
    eventually("B to see the disconnect", || !b.is_connected()).await;
    b.close();
}
