//! Async client behavior over the shared worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kindling::client::AsyncClient;
use kindling::server::{Responder, Server};

fn start_server() -> (Server, String) {
    let mut server = Server::new();
    server.get("/fast", |res: Responder| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        res.send("fast");
    });
    server.get("/slow", |res: Responder| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        res.send("slow");
    });
    server.listen("127.0.0.1", 0).expect("listen failed");
    let base = format!("http://127.0.0.1:{}", server.local_port());
    (server, base)
}

#[test]
fn concurrent_requests_with_independent_timeouts() {
    let (server, base) = start_server();
    let mut client = AsyncClient::new().expect("async client");
    client.timeout(Duration::from_secs(1));

    let fast_ok = Arc::new(AtomicBool::new(false));
    let slow_timed_out = Arc::new(AtomicBool::new(false));

    let started = Instant::now();
    {
        let fast_ok = fast_ok.clone();
        client.get_with(&format!("{base}/fast"), move |res| {
            fast_ok.store(res.ok(), Ordering::SeqCst);
        });
    }
    {
        let slow_timed_out = slow_timed_out.clone();
        client.get_with(&format!("{base}/slow"), move |res| {
            slow_timed_out.store(
                res.is_error() && res.error() == "timeout",
                Ordering::SeqCst,
            );
        });
    }
    assert!(client.pending_requests() > 0);

    assert!(client.wait_for(Duration::from_secs(4)), "requests stuck");
    let elapsed = started.elapsed();

    assert!(fast_ok.load(Ordering::SeqCst), "fast request should succeed");
    assert!(
        slow_timed_out.load(Ordering::SeqCst),
        "slow request should time out"
    );
    // the slow timeout (1 s) dominates wall time; the fast request ran
    // concurrently instead of queueing behind it
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");

    server.stop();
}

#[test]
fn wait_for_reports_unfinished_requests() {
    let (server, base) = start_server();
    let mut client = AsyncClient::new().expect("async client");
    client.timeout(Duration::from_secs(10));

    client.get_with(&format!("{base}/slow"), |_res| {});
    assert!(!client.wait_for(Duration::from_millis(200)));
    // nothing was cancelled by the bounded wait
    assert_eq!(client.pending_requests(), 1);

    client.stop();
    assert!(client.wait_for(Duration::from_secs(2)));

    server.stop();
}

#[test]
fn async_terminators_resolve_as_futures() {
    let (server, base) = start_server();
    let client = AsyncClient::new().expect("async client");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let res = rt.block_on(client.get(&format!("{base}/fast")));
    assert!(res.ok(), "error: {}", res.error());
    assert_eq!(res.body(), b"fast");

    server.stop();
}
