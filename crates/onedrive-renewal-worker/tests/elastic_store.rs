use futures_util::future::FutureExt;
use onedrive_renewal_worker::storage::{
    ElasticAuth, ElasticRecordStore, ExpiryCutoff, RecordStore, StoreError,
};
use serde_json::json;
use time::macros::datetime;
use url::Url;
use wiremock::{
    Mock, MockServer, Request, ResponseTemplate,
    matchers::{body_partial_json, header, method, path, query_param},
};

const EXPIRY_MILLIS: u64 = 1_714_550_400_000;

async fn try_start_mock() -> Option<MockServer> {
    let fut = MockServer::start();
    let fut = std::panic::AssertUnwindSafe(fut);
    fut.catch_unwind().await.ok()
}

fn store_for(server: &MockServer) -> ElasticRecordStore {
    ElasticRecordStore::new(
        reqwest::Client::new(),
        Url::parse(&server.uri()).expect("mock url"),
    )
    .expect("store")
}

fn hit(id: &str, user: &str, expires: &str, position: u64) -> serde_json::Value {
    json!({
        "_index": "ignored",
        "_id": id,
        "_source": {
            "tenantId": "contoso",
            "clientId": "client",
            "clientSecret": "secret",
            "userName": user,
            "expirationDateTime": expires,
        },
        "sort": [EXPIRY_MILLIS, position],
    })
}

fn hits(items: Vec<serde_json::Value>) -> serde_json::Value {
    json!({ "hits": { "hits": items } })
}

async fn mount_indices(server: &MockServer, names: &[&str]) {
    let rows: Vec<_> = names.iter().map(|name| json!({ "index": name })).collect();
    Mock::given(method("GET"))
        .and(path("/_cat/indices"))
        .and(query_param("format", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows))
        .mount(server)
        .await;
}

async fn mount_pit(server: &MockServer, index: &str, pit_id: &str, expected: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/{index}/_pit")))
        .and(query_param("keep_alive", "1m"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": pit_id })))
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_close(server: &MockServer, expected: u64) {
    Mock::given(method("DELETE"))
        .and(path("/_pit"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true, "num_freed": 1 })),
        )
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test]
async fn lists_expired_records_from_prefixed_indices_only() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping lists_expired_records_from_prefixed_indices_only: mock server unavailable");
            return;
        }
    };
    mount_indices(
        &server,
        &[
            "datasource_onedrive_connection_zeta",
            ".kibana",
            "datasource_gmail_connection_acme",
            "datasource_onedrive_connection_acme",
        ],
    )
    .await;
    mount_pit(&server, "datasource_onedrive_connection_acme", "pit-acme", 1).await;
    mount_pit(&server, "datasource_onedrive_connection_zeta", "pit-zeta", 1).await;
    mount_pit(&server, "datasource_gmail_connection_acme", "pit-gmail", 0).await;
    mount_close(&server, 2).await;
    Mock::given(method("POST"))
        .and(path("/_search"))
        .and(body_partial_json(json!({
            "query": { "range": { "expirationDateTime": { "lt": "now" } } },
            "sort": [
                { "expirationDateTime": { "order": "asc" } },
                { "_shard_doc": "asc" },
            ],
            "pit": { "id": "pit-acme", "keep_alive": "1m" },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(vec![hit(
            "a1",
            "alice",
            "2024-05-01T09:00:00.000Z",
            0,
        )])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search"))
        .and(body_partial_json(json!({ "pit": { "id": "pit-zeta" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(vec![hit(
            "z1",
            "zoe",
            "2024-05-01T08:00:00.000Z",
            0,
        )])))
        .expect(1)
        .mount(&server)
        .await;

    let records = store_for(&server)
        .list_expiring(&ExpiryCutoff::now())
        .await
        .expect("records");

    let located: Vec<_> = records
        .iter()
        .map(|stored| (stored.index.as_str(), stored.doc_id.as_str()))
        .collect();
    assert_eq!(
        located,
        vec![
            ("datasource_onedrive_connection_acme", "a1"),
            ("datasource_onedrive_connection_zeta", "z1"),
        ]
    );
    assert_eq!(records[0].record.user_name, "alice");
    assert_eq!(records[0].record.credentials().tenant_id, "contoso");
    server.verify().await;
}

#[tokio::test]
async fn pages_with_search_after_inside_one_point_in_time() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping pages_with_search_after_inside_one_point_in_time: mock server unavailable");
            return;
        }
    };
    mount_indices(&server, &["datasource_onedrive_connection_acme"]).await;
    mount_pit(&server, "datasource_onedrive_connection_acme", "pit-acme", 1).await;
    Mock::given(method("POST"))
        .and(path("/_search"))
        .and(body_partial_json(json!({ "size": 2, "pit": { "id": "pit-acme" } })))
        .respond_with(|request: &Request| {
            let body: serde_json::Value =
                serde_json::from_slice(&request.body).unwrap_or_default();
            if body.get("search_after").is_some() || body.get("from").is_some() {
                return ResponseTemplate::new(400);
            }
            // Both documents share one expiration; only the tiebreaker orders them.
            let mut page = hits(vec![
                hit("1", "u1", "2024-05-01T08:00:00.000Z", 0),
                hit("2", "u2", "2024-05-01T08:00:00.000Z", 1),
            ]);
            page["pit_id"] = json!("pit-acme-2");
            ResponseTemplate::new(200).set_body_json(page)
        })
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search"))
        .and(body_partial_json(json!({
            "size": 2,
            "pit": { "id": "pit-acme-2" },
            "search_after": [EXPIRY_MILLIS, 1],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(vec![hit(
            "3",
            "u3",
            "2024-05-01T08:00:00.000Z",
            2,
        )])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/_pit"))
        .and(body_partial_json(json!({ "id": "pit-acme-2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true })))
        .expect(1)
        .mount(&server)
        .await;

    let records = store_for(&server)
        .with_page_size(2)
        .list_expiring(&ExpiryCutoff::now())
        .await
        .expect("records");

    let ids: Vec<_> = records.iter().map(|stored| stored.doc_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    server.verify().await;
}

#[tokio::test]
async fn index_removed_before_search_is_treated_as_empty() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping index_removed_before_search_is_treated_as_empty: mock server unavailable");
            return;
        }
    };
    mount_indices(&server, &["datasource_onedrive_connection_acme"]).await;
    Mock::given(method("POST"))
        .and(path("/datasource_onedrive_connection_acme/_pit"))
        .respond_with(ResponseTemplate::new(404).set_body_string("index_not_found_exception"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(vec![])))
        .expect(0)
        .mount(&server)
        .await;
    mount_close(&server, 0).await;

    let records = store_for(&server)
        .list_expiring(&ExpiryCutoff::now())
        .await
        .expect("records");

    assert!(records.is_empty());
    server.verify().await;
}

#[tokio::test]
async fn malformed_documents_are_skipped() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping malformed_documents_are_skipped: mock server unavailable");
            return;
        }
    };
    mount_indices(&server, &["datasource_onedrive_connection_acme"]).await;
    mount_pit(&server, "datasource_onedrive_connection_acme", "pit-acme", 1).await;
    mount_close(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(vec![
            json!({ "_id": "broken", "_source": { "userName": "nobody" }, "sort": [0, 0] }),
            hit("ok", "alice", "2024-05-01T08:00:00.000Z", 1),
        ])))
        .mount(&server)
        .await;

    let records = store_for(&server)
        .list_expiring(&ExpiryCutoff::now())
        .await
        .expect("records");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].doc_id, "ok");
}

#[tokio::test]
async fn search_failure_surfaces_as_fetch_error() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping search_failure_surfaces_as_fetch_error: mock server unavailable");
            return;
        }
    };
    mount_indices(&server, &["datasource_onedrive_connection_acme"]).await;
    mount_pit(&server, "datasource_onedrive_connection_acme", "pit-acme", 1).await;
    mount_close(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/_search"))
        .respond_with(ResponseTemplate::new(500).set_body_string("search_phase_execution_exception"))
        .mount(&server)
        .await;

    let err = store_for(&server)
        .list_expiring(&ExpiryCutoff::now())
        .await
        .expect_err("fetch failure");

    match err {
        StoreError::Fetch { target, status, body } => {
            assert_eq!(target, "datasource_onedrive_connection_acme");
            assert_eq!(status, 500);
            assert_eq!(body, "search_phase_execution_exception");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    server.verify().await;
}

#[tokio::test]
async fn apply_renewal_sends_partial_update() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping apply_renewal_sends_partial_update: mock server unavailable");
            return;
        }
    };
    Mock::given(method("POST"))
        .and(path("/datasource_onedrive_connection_acme/_update/a1"))
        .and(header("authorization", "ApiKey c2VjcmV0"))
        .and(body_partial_json(json!({
            "doc": { "expirationDateTime": "2024-05-01T11:00:00.000Z" }
        })))
        .respond_with(|request: &Request| {
            let body: serde_json::Value =
                serde_json::from_slice(&request.body).unwrap_or_default();
            let doc = body["doc"].as_object().cloned().unwrap_or_default();
            let only_expected_fields = doc.len() == 2 && doc.contains_key("updatedAt");
            ResponseTemplate::new(if only_expected_fields { 200 } else { 400 })
                .set_body_json(json!({ "result": "updated" }))
        })
        .expect(1)
        .mount(&server)
        .await;

    store_for(&server)
        .with_auth(ElasticAuth::ApiKey("c2VjcmV0".into()))
        .apply_renewal(
            "datasource_onedrive_connection_acme",
            "a1",
            datetime!(2024-05-01 11:00 UTC),
        )
        .await
        .expect("update");
    server.verify().await;
}

#[tokio::test]
async fn update_failure_keeps_location_and_status() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping update_failure_keeps_location_and_status: mock server unavailable");
            return;
        }
    };
    Mock::given(method("POST"))
        .and(path("/datasource_onedrive_connection_acme/_update/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_string("document_missing_exception"))
        .mount(&server)
        .await;

    let err = store_for(&server)
        .apply_renewal(
            "datasource_onedrive_connection_acme",
            "gone",
            datetime!(2024-05-01 11:00 UTC),
        )
        .await
        .expect_err("missing document");

    assert!(matches!(
        err,
        StoreError::Update { ref doc_id, status: 404, .. } if doc_id == "gone"
    ));
}
