//! Integration tests for the epidash API endpoints.
//!
//! These tests drive the full request/response cycle through the HTTP API,
//! against a local stand-in for the upstream statistics services.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{Json, Router, http::StatusCode, routing::get};
use axum_test::TestServer;
use chrono::{FixedOffset, TimeDelta};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use epidash::aggregation::{Aggregator, RegionContext};
use epidash::api::{AppState, router};
use epidash::boundary::BoundaryDataset;
use epidash::config::AppConfig;
use epidash::dashboard::{Dashboard, ingest_area_history};
use epidash::data_sources::{Archive, EndpointRegistry, RetryPolicy, SnapshotFetcher};
use epidash::model::RegionLevel;
use epidash::normalize::NameNormalizer;
use epidash::storage::Storage;
use epidash::table_cache::TableCache;
use epidash::temporal::TemporalIndexer;

fn qq_doc() -> Value {
    json!({
        "data": {
            "wuwei_ww_cn_day_counts": [
                {"date": "01/22", "confirm": 571, "suspect": 393, "dead": 17, "heal": 25},
                {"date": "01/20", "confirm": 291, "suspect": 54, "dead": 6, "heal": 25}
            ],
            "wuwei_ww_global_vars": [
                {"confirmCount": 571, "suspectCount": 393, "deadCount": 17, "cure": 25,
                 "update_time": "2020-01-22 23:00:00"}
            ]
        }
    })
}

fn dxy_doc() -> Value {
    json!({
        "data": {
            "getAreaStat": [
                {
                    "provinceName": "湖北省", "provinceShortName": "湖北",
                    "confirmedCount": 444, "suspectedCount": 0, "curedCount": 28, "deadCount": 17,
                    "cities": [
                        {"cityName": "武汉", "confirmedCount": 425, "suspectedCount": 0, "curedCount": 28, "deadCount": 17},
                        {"cityName": "恩施州", "confirmedCount": 9, "suspectedCount": 0, "curedCount": 0, "deadCount": 0}
                    ]
                },
                {
                    "provinceName": "广西壮族自治区", "provinceShortName": "广西",
                    "confirmedCount": 2, "suspectedCount": 0, "curedCount": 0, "deadCount": 0,
                    "cities": [
                        {"cityName": "未明确地区", "confirmedCount": 2, "suspectedCount": 0, "curedCount": 0, "deadCount": 0}
                    ]
                },
                {
                    "provinceName": "上海市", "provinceShortName": "上海",
                    "confirmedCount": 16, "suspectedCount": 0, "curedCount": 0, "deadCount": 0,
                    "cities": []
                }
            ]
        }
    })
}

fn area_history_doc() -> Value {
    // 2020-02-01 10:00 and 11:00 at UTC+8.
    json!({
        "results": [
            {"provinceShortName": "湖北", "updateTime": 1580522400000i64,
             "confirmedCount": 7153, "suspectedCount": 0, "curedCount": 0, "deadCount": 249},
            {"provinceShortName": "广西", "updateTime": 1580526000000i64,
             "confirmedCount": 100, "suspectedCount": 0, "curedCount": 0, "deadCount": 0}
        ]
    })
}

/// Serve the upstream documents; primary endpoints answer 503 while `failing` is set.
async fn spawn_upstream(failing: Arc<AtomicBool>) -> String {
    let primary = move |doc: Value| {
        let failing = failing.clone();
        move || async move {
            if failing.load(Ordering::SeqCst) {
                Err(StatusCode::SERVICE_UNAVAILABLE)
            } else {
                Ok(Json(doc))
            }
        }
    };

    let app = Router::new()
        .route("/qq", get(primary(qq_doc())))
        .route("/dxy", get(primary(dxy_doc())))
        .route("/area_history", get(|| async { Json(area_history_doc()) }))
        .route("/overall_history", get(|| async { Json(json!({"results": []})) }))
        .route("/province_city_history", get(|| async { Json(json!([])) }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

struct Harness {
    server: TestServer,
    storage: Storage,
    failing: Arc<AtomicBool>,
}

async fn create_test_server(name: &str, max_age: Duration) -> Harness {
    let failing = Arc::new(AtomicBool::new(false));
    let base_url = spawn_upstream(failing.clone()).await;

    let dir: PathBuf = std::env::temp_dir().join(format!("epidash-api-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    let cst = FixedOffset::east_opt(8 * 3600).unwrap();
    let config = AppConfig {
        frames_dir: dir.join("frames"),
        ..AppConfig::default()
    };

    let registry = EndpointRegistry::rooted_at(&base_url).with_retry_all(RetryPolicy::none());
    let fetcher = SnapshotFetcher::new(registry, Archive::new(dir.join("history"), cst), Duration::from_secs(5)).unwrap();

    let provinces = BoundaryDataset::from_names(
        RegionLevel::Province,
        "NL_NAME_1",
        ["湖北", "广西壮族自治区", "上海"],
    );
    let cities = BoundaryDataset::from_names(
        RegionLevel::City,
        "NAME",
        ["武汉", "恩施土家族苗族自治州", "上海"],
    );
    let aggregator = Aggregator::new(
        cst,
        RegionContext::new(NameNormalizer::provinces(), provinces),
        RegionContext::new(NameNormalizer::cities(), cities),
    );

    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let dashboard = Dashboard::new(
        fetcher,
        aggregator,
        TemporalIndexer::new(TimeDelta::minutes(30), cst),
        TableCache::new(dir.join("data"), max_age),
        storage.clone(),
        &config,
    );

    Harness {
        server: TestServer::new(router(AppState { dashboard })).unwrap(),
        storage,
        failing,
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = create_test_server("health", Duration::from_secs(3600)).await;

    let response = harness.server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_trend_endpoint() {
    let harness = create_test_server("trend", Duration::from_secs(3600)).await;

    let response = harness.server.get("/trend").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["stale"], false);

    let dates = body["data"]["dates"].as_array().unwrap();
    // Baseline 01-10..01-19, then 01-20..01-22 with 01-21 carried forward.
    assert_eq!(dates[0], "2020-01-10");
    assert_eq!(dates[dates.len() - 1], "2020-01-22");
    assert_eq!(dates.len(), 13);

    let confirmed = &body["data"]["panels"][0][0];
    assert_eq!(confirmed["color"], "#E51017");
    assert_eq!(confirmed["values"].as_array().unwrap().last().unwrap(), 571);
}

#[tokio::test]
async fn test_counts_endpoint() {
    let harness = create_test_server("counts", Duration::from_secs(3600)).await;

    let response = harness.server.get("/counts").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["confirmed"], "00571");
    assert_eq!(body["data"]["dead"], "00017");
    assert_eq!(body["data"]["update_time"], "2020-01-22 23:00:00");
}

#[tokio::test]
async fn test_province_map_endpoint() {
    let harness = create_test_server("provinces", Duration::from_secs(3600)).await;

    let response = harness.server.get("/maps/provinces").await;

    response.assert_status_ok();
    let body: Value = response.json();
    let map = &body["data"];
    assert_eq!(map["feature_id_key"], "properties.NL_NAME_1");
    assert_eq!(map["colorscale"], "BuPu");

    let locations: Vec<&str> = map["locations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(locations.contains(&"广西壮族自治区"));
    assert!(locations.contains(&"湖北"));
}

#[tokio::test]
async fn test_city_map_endpoint() {
    let harness = create_test_server("cities", Duration::from_secs(3600)).await;

    let response = harness.server.get("/maps/cities").await;

    response.assert_status_ok();
    let body: Value = response.json();
    let map = &body["data"];
    assert_eq!(map["colorscale"], "PuRd");

    let locations: Vec<&str> = map["locations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    // Municipality as a single entry, alias resolved, unknown name dropped.
    assert!(locations.contains(&"上海"));
    assert!(locations.contains(&"恩施土家族苗族自治州"));
    assert!(!locations.contains(&"未明确"));
    assert_eq!(locations.len(), 3);
}

#[tokio::test]
async fn test_unavailable_without_prior_data() {
    let harness = create_test_server("unavailable", Duration::from_secs(3600)).await;
    harness.failing.store(true, Ordering::SeqCst);

    for path in ["/trend", "/counts", "/maps/provinces"] {
        let response = harness.server.get(path).await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json();
        assert_eq!(body["status"], "unavailable");
    }
}

#[tokio::test]
async fn test_stale_fallback_after_failure() {
    let harness = create_test_server("stale", Duration::ZERO).await;

    harness.server.post("/refresh").await.assert_status_ok();
    harness.failing.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let response = harness.server.get("/maps/cities").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["stale"], true);

    let response = harness.server.get("/trend").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["stale"], true);

    harness
        .server
        .post("/refresh")
        .await
        .assert_status(StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_timeline_endpoint() {
    let harness = create_test_server("timeline", Duration::from_secs(3600)).await;
    ingest_area_history(&harness.storage, &NameNormalizer::provinces(), &area_history_doc())
        .await
        .unwrap();

    let response = harness
        .server
        .get("/timeline?start=2020-02-01&end=2020-02-01")
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    let frames = body["frames"].as_array().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["caption"], "2020-02-01 10:00:00");
    // Universe order: 湖北, 广西壮族自治区, 上海; Hubei is carried into the second frame.
    assert_eq!(frames[0]["values"], json!([7153, 0, 0]));
    assert_eq!(frames[1]["values"], json!([7153, 100, 0]));
}

#[tokio::test]
async fn test_timeline_empty_and_invalid_ranges() {
    let harness = create_test_server("timeline-empty", Duration::from_secs(3600)).await;

    harness
        .server
        .get("/timeline?start=2020-03-01&end=2020-03-02")
        .await
        .assert_status(StatusCode::NOT_FOUND);

    harness
        .server
        .get("/timeline?start=2020-03-02&end=2020-03-01")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_refresh_endpoint() {
    let harness = create_test_server("refresh", Duration::from_secs(3600)).await;

    let response = harness.server.post("/refresh").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["provinces"], 3);
    assert_eq!(body["cities"], 3);
    assert_eq!(body["unresolved"], json!(["未明确"]));
}
