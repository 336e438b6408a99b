//! End-to-end apply of wal2json payloads against a mock Meilisearch server.

use mockito::{Matcher, Server};
use pgmeili_core::{ChangeBatch, ChangeSink, RouteOutcome, SyncTarget, WalRouter};
use pgmeili_search::{MeiliClient, MeiliConfig, SyncError, SyncHandler};
use serde_json::json;

const ENQUEUED: &str = r#"{"taskUid":1,"indexUid":"tenant","status":"enqueued"}"#;

fn router(server: &Server) -> WalRouter<SyncHandler<MeiliClient>> {
    let client =
        MeiliClient::new(MeiliConfig::new(server.url()).with_api_key("masterKey")).unwrap();
    let mut router = WalRouter::new();
    router
        .register(
            "main.tenants",
            SyncHandler::new(SyncTarget::new("main.tenants", "tenant", "id"), client),
        )
        .unwrap();
    router
}

async fn dispatch(
    router: &WalRouter<SyncHandler<MeiliClient>>,
    record: serde_json::Value,
) -> RouteOutcome<SyncError> {
    let payload = serde_json::to_vec(&json!({ "change": [record] })).unwrap();
    let mut changes = ChangeBatch::parse(&payload)
        .unwrap()
        .into_changes(0x16B3748)
        .unwrap();
    assert_eq!(changes.len(), 1);
    router.dispatch(&changes.remove(0)).await
}

#[tokio::test]
async fn insert_posts_one_document() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/indexes/tenant/documents?primaryKey=id")
        .match_header("authorization", "Bearer masterKey")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!([{"id": 5, "name": "Acme"}])))
        .with_status(202)
        .with_body(ENQUEUED)
        .expect(1)
        .create_async()
        .await;

    let outcome = dispatch(
        &router(&server),
        json!({"kind":"insert","schema":"main","table":"tenants",
               "columnnames":["id","name"],"columnvalues":[5,"Acme"]}),
    )
    .await;

    assert!(matches!(outcome, RouteOutcome::Applied));
    mock.assert_async().await;
}

#[tokio::test]
async fn delete_calls_delete_by_id() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", "/indexes/tenant/documents/5")
        .match_header("authorization", "Bearer masterKey")
        .with_status(202)
        .with_body(ENQUEUED)
        .expect(1)
        .create_async()
        .await;

    let outcome = dispatch(
        &router(&server),
        json!({"kind":"delete","schema":"main","table":"tenants",
               "oldkeys":{"keynames":["id"],"keyvalues":[5]}}),
    )
    .await;

    assert!(matches!(outcome, RouteOutcome::Applied));
    mock.assert_async().await;
}

#[tokio::test]
async fn delete_without_old_keys_sends_nothing() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let outcome = dispatch(
        &router(&server),
        json!({"kind":"delete","schema":"main","table":"tenants"}),
    )
    .await;

    match outcome {
        RouteOutcome::Failed(err) => assert!(err.to_string().contains("main.tenants")),
        other => panic!("expected failure, got {:?}", other),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn unrouted_table_sends_nothing() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let outcome = dispatch(
        &router(&server),
        json!({"kind":"insert","schema":"main","table":"audit_log",
               "columnnames":["id"],"columnvalues":[1]}),
    )
    .await;

    assert!(matches!(outcome, RouteOutcome::Unrouted));
    mock.assert_async().await;
}

#[tokio::test]
async fn server_error_does_not_stop_the_sink() {
    let mut server = Server::new_async().await;
    let failing = server
        .mock("DELETE", "/indexes/tenant/documents/1")
        .with_status(500)
        .with_body(r#"{"message":"internal","code":"internal"}"#)
        .expect(1)
        .create_async()
        .await;
    let ok = server
        .mock("DELETE", "/indexes/tenant/documents/2")
        .with_status(202)
        .with_body(ENQUEUED)
        .expect(1)
        .create_async()
        .await;

    let router = router(&server);
    let payload = serde_json::to_vec(&json!({"change": [
        {"kind":"delete","schema":"main","table":"tenants","oldkeys":{"keynames":["id"],"keyvalues":[1]}},
        {"kind":"delete","schema":"main","table":"tenants","oldkeys":{"keynames":["id"],"keyvalues":[2]}}
    ]}))
    .unwrap();
    for change in ChangeBatch::parse(&payload).unwrap().into_changes(1).unwrap() {
        router.deliver(change).await;
    }

    failing.assert_async().await;
    ok.assert_async().await;
}
