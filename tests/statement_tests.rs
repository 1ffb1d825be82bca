//! Statement Executor Tests
//!
//! Black-box tests for the prepared-statement lifecycle:
//! - one-shot first execution, prepare on reuse, slot reuse
//! - shape mutation deallocates and restarts the cycle
//! - silent fallback under the server's prepared-statement cap
//! - local rejection of unbound placeholders

mod common;

use std::sync::atomic::Ordering;

use common::{ServerOptions, TestServer};
use coraldb_client::{Session, SessionBuilder, Statement};
use serde_json::json;

async fn seeded_session(server: &TestServer) -> Session {
    let session = Session::connect(&server.url()).await.unwrap();
    let mut insert = Statement::insert("users");
    insert
        .add_row(json!({"name": "Alice", "age": 10}))
        .add_row(json!({"name": "Bob", "age": 20}))
        .add_row(json!({"name": "Carol", "age": 30}));
    insert.execute(&session).await.unwrap();
    session
}

struct Snapshot {
    one_shot: usize,
    prepares: usize,
    prepared_executes: usize,
    deallocates: usize,
}

fn snapshot(server: &TestServer) -> Snapshot {
    let c = server.counters();
    Snapshot {
        one_shot: c.one_shot_executes.load(Ordering::SeqCst),
        prepares: c.prepares.load(Ordering::SeqCst),
        prepared_executes: c.prepared_executes.load(Ordering::SeqCst),
        deallocates: c.deallocates.load(Ordering::SeqCst),
    }
}

// ============================================================================
// Unbound placeholders
// ============================================================================

#[tokio::test]
async fn test_unbound_placeholder_fails_before_any_network_call() {
    let server = TestServer::spawn().await;
    let session = seeded_session(&server).await;
    let before = snapshot(&server);

    let mut stmt = Statement::find("users");
    stmt.filter("name == :arg2");
    let err = stmt.execute(&session).await.unwrap_err();
    assert!(err.is_usage());
    assert!(err.to_string().contains(":arg2"));

    // Same for SQL statements carrying the placeholder
    let mut sql = Statement::sql("SELECT :arg2");
    let err = sql.execute(&session).await.unwrap_err();
    assert!(err.is_usage());

    let after = snapshot(&server);
    assert_eq!(after.one_shot, before.one_shot);
    assert_eq!(after.prepares, before.prepares);
}

#[tokio::test]
async fn test_partially_bound_placeholders_rejected() {
    let server = TestServer::spawn().await;
    let session = seeded_session(&server).await;

    let mut stmt = Statement::find("users");
    stmt.filter("age > :min").bind("other", json!(1));
    let err = stmt.execute(&session).await.unwrap_err();
    assert!(err.is_usage());
    assert!(err.to_string().contains(":min"));
}

// ============================================================================
// Prepared lifecycle
// ============================================================================

#[tokio::test]
async fn test_second_execute_prepares_third_reuses() {
    let server = TestServer::spawn().await;
    let session = seeded_session(&server).await;
    let base = snapshot(&server);

    let mut stmt = Statement::find("users");
    stmt.filter("age > :age").bind("age", json!(5));

    // 1st: one-shot
    let mut res = stmt.execute(&session).await.unwrap();
    assert_eq!(res.count(), 3);
    let s = snapshot(&server);
    assert_eq!(s.one_shot, base.one_shot + 1);
    assert_eq!(s.prepares, base.prepares);

    // 2nd, unchanged shape, fresh bound value: exactly one prepare
    stmt.bind("age", json!(15));
    let mut res = stmt.execute(&session).await.unwrap();
    assert_eq!(res.count(), 2);
    let s = snapshot(&server);
    assert_eq!(s.prepares, base.prepares + 1);
    assert_eq!(s.prepared_executes, base.prepared_executes + 1);

    // 3rd: the slot is reused, no new prepare
    stmt.bind("age", json!(25));
    let mut res = stmt.execute(&session).await.unwrap();
    assert_eq!(res.count(), 1);
    let s = snapshot(&server);
    assert_eq!(s.prepares, base.prepares + 1);
    assert_eq!(s.prepared_executes, base.prepared_executes + 2);
    assert_eq!(s.one_shot, base.one_shot + 1);
}

#[tokio::test]
async fn test_shape_mutation_deallocates_and_restarts_cycle() {
    let server = TestServer::spawn().await;
    let session = seeded_session(&server).await;

    let mut stmt = Statement::find("users");
    stmt.filter("age > :age").bind("age", json!(5));
    stmt.execute(&session).await.unwrap();
    stmt.execute(&session).await.unwrap(); // prepares
    let base = snapshot(&server);

    // First limit added: the shape changed
    stmt.limit(1);
    let mut res = stmt.execute(&session).await.unwrap();
    assert_eq!(res.count(), 1);
    let s = snapshot(&server);
    assert_eq!(s.deallocates, base.deallocates + 1);
    assert_eq!(s.one_shot, base.one_shot + 1);
    assert_eq!(s.prepares, base.prepares);

    // Reusing the mutated shape allocates a new slot
    stmt.execute(&session).await.unwrap();
    let s = snapshot(&server);
    assert_eq!(s.prepares, base.prepares + 1);
    assert_eq!(s.prepared_executes, base.prepared_executes + 1);
}

#[tokio::test]
async fn test_sort_mutation_resets_prepared_state() {
    let server = TestServer::spawn().await;
    let session = seeded_session(&server).await;

    let mut stmt = Statement::find("users");
    stmt.filter("age > :age").bind("age", json!(5));
    stmt.execute(&session).await.unwrap();
    stmt.execute(&session).await.unwrap();
    let base = snapshot(&server);

    stmt.sort(["age desc"]);
    let mut res = stmt.execute(&session).await.unwrap();
    let first = res.next().unwrap();
    assert_eq!(first.document()["age"], 30);
    let s = snapshot(&server);
    assert_eq!(s.deallocates, base.deallocates + 1);
    assert_eq!(s.one_shot, base.one_shot + 1);
}

// ============================================================================
// Fallback
// ============================================================================

#[tokio::test]
async fn test_prepare_cap_falls_back_to_one_shot_silently() {
    let server = TestServer::spawn_with(ServerOptions {
        max_prepared: Some(0),
        ..Default::default()
    })
    .await;
    let session = seeded_session(&server).await;
    let base = snapshot(&server);

    let mut stmt = Statement::find("users");
    stmt.filter("age > :age").bind("age", json!(5));

    // 1st execute: one-shot
    assert_eq!(stmt.execute(&session).await.unwrap().count(), 3);
    // 2nd: prepare refused with the cap error; the caller sees a clean result
    assert_eq!(stmt.execute(&session).await.unwrap().count(), 3);
    let s = snapshot(&server);
    assert_eq!(s.prepares, base.prepares + 1);
    assert_eq!(s.one_shot, base.one_shot + 2);
    assert_eq!(s.prepared_executes, base.prepared_executes);

    // 3rd: the statement stays in fallback, no further prepare attempts
    assert_eq!(stmt.execute(&session).await.unwrap().count(), 3);
    let s = snapshot(&server);
    assert_eq!(s.prepares, base.prepares + 1);
    assert_eq!(s.one_shot, base.one_shot + 3);
}

#[tokio::test]
async fn test_shape_change_resets_fallback_to_initial() {
    let server = TestServer::spawn_with(ServerOptions {
        max_prepared: Some(0),
        ..Default::default()
    })
    .await;
    let session = seeded_session(&server).await;

    let mut stmt = Statement::find("users");
    stmt.filter("age > :age").bind("age", json!(5));
    stmt.execute(&session).await.unwrap();
    stmt.execute(&session).await.unwrap(); // enters fallback
    let base = snapshot(&server);

    // A shape change resets to the initial state: the next reuse attempts
    // to prepare again
    stmt.limit(2);
    stmt.execute(&session).await.unwrap();
    stmt.execute(&session).await.unwrap();
    let s = snapshot(&server);
    assert_eq!(s.prepares, base.prepares + 1);
}

#[tokio::test]
async fn test_non_eligible_prepare_error_propagates() {
    let server = TestServer::spawn_with(ServerOptions {
        prepare_error: Some(1300),
        ..Default::default()
    })
    .await;
    let session = seeded_session(&server).await;

    let mut stmt = Statement::find("users");
    stmt.filter("age > :age").bind("age", json!(5));
    stmt.execute(&session).await.unwrap();

    let err = stmt.execute(&session).await.unwrap_err();
    assert!(err.is_server());
    assert_eq!(err.server_code(), Some(1300));
}

#[tokio::test]
async fn test_fallback_codes_are_session_policy() {
    let server = TestServer::spawn_with(ServerOptions {
        prepare_error: Some(1300),
        ..Default::default()
    })
    .await;
    // The same refusal code, declared fallback-eligible for this session
    let session = SessionBuilder::new()
        .address("127.0.0.1", server.addr.port(), 100)
        .user("admin")
        .password("secret")
        .schema("test")
        .prepare_fallback_codes([1300])
        .connect()
        .await
        .unwrap();

    let mut insert = Statement::insert("users");
    insert.add_row(json!({"age": 10}));
    insert.execute(&session).await.unwrap();

    let mut stmt = Statement::find("users");
    stmt.filter("age > :age").bind("age", json!(5));
    stmt.execute(&session).await.unwrap();
    // Falls back instead of failing
    assert_eq!(stmt.execute(&session).await.unwrap().count(), 1);
}
