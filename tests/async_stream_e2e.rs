#![cfg(feature = "async-stream")]

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use quotepool::{ClientId, SessionConfig, StreamSession};

use support::{config, key, pool, wait_until, OpenerEvent, ScriptedOpener, WAIT};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_bridges_onto_async_stream() {
    support::init_tracing();
    let opener = ScriptedOpener::new();
    let pool = pool(config(1, 4, Duration::from_secs(30)), &opener);
    let x = key("X");

    let session =
        StreamSession::open(Arc::clone(&pool), ClientId::parse("async").unwrap(), SessionConfig::default()).unwrap();
    session.add_interest(&x).unwrap();
    let mut stream = session.into_stream(16);

    let wait_opened = {
        let opener = Arc::clone(&opener);
        let x = x.clone();
        tokio::task::spawn_blocking(move || opener.expect(&OpenerEvent::Opened(x)))
    };
    wait_opened.await.unwrap();
    opener.push(&x, "12.5");

    let event = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert_eq!(event.key, x);
    assert_eq!(event.value, "12.5");

    // Dropping the consumer tears the session down within a poll interval.
    drop(stream);
    let pool_for_wait = Arc::clone(&pool);
    let released = tokio::task::spawn_blocking(move || {
        wait_until(Duration::from_secs(3), || pool_for_wait.stats().subscriber_count == 0)
    })
    .await
    .unwrap();
    assert!(released);
}
