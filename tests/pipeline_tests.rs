//! Pipelining Tests
//!
//! Black-box tests for the FIFO request pipeline:
//! - completion order under server-side jitter
//! - error scoping to a single in-flight request
//! - wholesale failure on connection death

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{ServerOptions, TestServer};
use coraldb_client::protocol::Command;
use coraldb_client::{Error, Session, Statement};
use parking_lot::Mutex;

/// Delay SQL statements whose literal is even; leave the rest fast.
fn staggered_delay() -> common::DelayFn {
    Arc::new(|cmd: &Command| {
        let text = match cmd {
            Command::StmtExecute { stmt } => stmt.sql.clone().unwrap_or_default(),
            _ => String::new(),
        };
        let n: u64 = text
            .rsplit(' ')
            .next()
            .and_then(|t| t.parse().ok())
            .unwrap_or(1);
        if n % 2 == 0 {
            Duration::from_millis(30)
        } else {
            Duration::ZERO
        }
    })
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_futures_complete_in_submission_order_despite_jitter() {
    let server = TestServer::spawn_with(ServerOptions {
        delay: Some(staggered_delay()),
        ..Default::default()
    })
    .await;
    let session = Arc::new(Session::connect(&server.url()).await.unwrap());

    // Submit everything before awaiting anything
    let mut pendings = Vec::new();
    for i in 0..6u64 {
        let mut stmt = Statement::sql(format!("SELECT {}", i));
        pendings.push(stmt.submit(&session).await.unwrap());
    }

    let completion_order: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (i, pending) in pendings.into_iter().enumerate() {
        let order = Arc::clone(&completion_order);
        handles.push(tokio::spawn(async move {
            let mut result = pending.await.unwrap();
            let value = result.next().unwrap().get(0).unwrap().as_u64().unwrap();
            order.lock().push(i as u64);
            value
        }));
    }

    let values = futures::future::join_all(handles).await;
    for (i, value) in values.into_iter().enumerate() {
        // Every future carries its own response, never a sibling's
        assert_eq!(value.unwrap(), i as u64);
    }
    // And they resolved in exact submission order despite the jitter
    assert_eq!(&*completion_order.lock(), &[0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_fast_response_waits_behind_slow_head() {
    let server = TestServer::spawn_with(ServerOptions {
        delay: Some(staggered_delay()),
        ..Default::default()
    })
    .await;
    let session = Session::connect(&server.url()).await.unwrap();

    let mut slow = Statement::sql("SELECT 42"); // even: 30ms server time
    let mut fast = Statement::sql("SELECT 7"); // odd: immediate

    let started = Instant::now();
    let slow_pending = slow.submit(&session).await.unwrap();
    let fast_pending = fast.submit(&session).await.unwrap();

    // Awaiting the fast statement first still waits for the slow head:
    // responses are delivered strictly in submission order.
    let mut fast_result = fast_pending.await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(fast_result.next().unwrap().get(0).unwrap().as_u64(), Some(7));

    let mut slow_result = slow_pending.await.unwrap();
    assert_eq!(slow_result.next().unwrap().get(0).unwrap().as_u64(), Some(42));
}

// ============================================================================
// Error scoping
// ============================================================================

#[tokio::test]
async fn test_server_error_scoped_to_one_request() {
    let server = TestServer::spawn().await;
    let session = Session::connect(&server.url()).await.unwrap();

    let mut before = Statement::sql("SELECT 1");
    let mut bad = Statement::find("no_such_collection");
    let mut after = Statement::sql("SELECT 2");

    let p1 = before.submit(&session).await.unwrap();
    let p2 = bad.submit(&session).await.unwrap();
    let p3 = after.submit(&session).await.unwrap();

    assert_eq!(p1.await.unwrap().next().unwrap().get(0).unwrap().as_u64(), Some(1));

    let err = p2.await.unwrap_err();
    assert!(err.is_server());
    assert_eq!(err.server_code(), Some(1100));

    // The sibling in flight behind the failed request is unaffected
    assert_eq!(p3.await.unwrap().next().unwrap().get(0).unwrap().as_u64(), Some(2));

    // And the session keeps working
    session.ping().await.unwrap();
}

// ============================================================================
// Connection death
// ============================================================================

#[tokio::test]
async fn test_connection_death_fails_all_in_flight() {
    // Answers auth and one statement, then drops the connection
    let server = TestServer::spawn_with(ServerOptions {
        die_after: Some(2),
        ..Default::default()
    })
    .await;
    let session = Session::connect(&server.url()).await.unwrap();

    let mut first = Statement::sql("SELECT 1");
    first.execute(&session).await.unwrap();

    let mut a = Statement::sql("SELECT 2");
    let mut b = Statement::sql("SELECT 3");
    let pa = a.submit(&session).await.unwrap();
    let pb = b.submit(&session).await.unwrap();

    let ea = pa.await.unwrap_err();
    let eb = pb.await.unwrap_err();
    assert!(ea.is_communications());
    assert!(eb.is_communications());

    // Later submissions fail terminally as well
    let mut later = Statement::sql("SELECT 4");
    let err = loop {
        match later.execute(&session).await {
            Err(e) => break e,
            // The writer half may not have observed the death yet
            Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    };
    assert!(err.is_communications());
}

#[tokio::test]
async fn test_close_cancels_outstanding_futures() {
    let server = TestServer::spawn_with(ServerOptions {
        delay: Some(Arc::new(|_| Duration::from_millis(200))),
        ..Default::default()
    })
    .await;
    let session = Session::connect(&server.url()).await.unwrap();

    let mut stmt = Statement::sql("SELECT 5");
    let pending = stmt.submit(&session).await.unwrap();

    session.close().await;

    let err = pending.await.unwrap_err();
    assert!(matches!(err, Error::SessionClosed));
}
