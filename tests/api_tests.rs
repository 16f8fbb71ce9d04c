use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, test, web};
use edgemgr::backend::MockGpioBackend;
use edgemgr::config::{AppConfig, EdgeDetect};
use edgemgr::gpio::GpioManager;
use edgemgr::routes::AppState;
use serde_json::{Value, json};

fn sample_config() -> AppConfig {
    AppConfig::from_json(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1"
            },
            "channels": {
                "18": { "name": "BUTTON", "line": 79 },
                "19": { "name": "DOOR SENSOR", "line": 80 },
                "SPI_CS": { "name": "CHIP SELECT", "line": 12, "gpio_name": "PZ.02" }
            },
            "event_history_capacity": 4
        }
        "#,
    )
    .expect("valid sample config")
}

fn sample_state() -> (AppState<MockGpioBackend>, Arc<MockGpioBackend>, String) {
    let cfg = Arc::new(sample_config());
    let backend = Arc::new(MockGpioBackend::default());
    let manager = Arc::new(GpioManager::new(cfg.clone(), backend.clone()));
    (AppState { manager }, backend, cfg.http.path.clone())
}

async fn settle() {
    actix_rt::time::sleep(Duration::from_millis(50)).await;
}

#[actix_rt::test]
async fn list_channels_returns_all() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/channels").to_request();
    let response: HashMap<String, Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response.len(), 3);

    let button = response.get("18").unwrap();
    assert_eq!(button["info"]["name"], "BUTTON");
    assert_eq!(button["info"]["line"], 79);
    assert!(button["events"].is_null());
    assert_eq!(response["SPI_CS"]["info"]["gpio_name"], "PZ.02");
}

#[actix_rt::test]
async fn unknown_channel_returns_404() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/channel/7").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/7/detect")
        .set_json(json!({ "edge": "rising" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post().uri("/api/v1/channels").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 405);

    let req = test::TestRequest::get()
        .uri("/api/v1/channel/18/detect")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 405);

    let req = test::TestRequest::put()
        .uri("/api/v1/channel/18/value")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 405);
}

#[actix_rt::test]
async fn setup_then_read_value() {
    let (state, backend, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/channel/18/value")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 500);

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/18/setup")
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());
    assert!(backend.is_exported(79));

    backend.set_value(79, 1);
    let req = test::TestRequest::get()
        .uri("/api/v1/channel/18/value")
        .to_request();
    let value: u8 = test::call_and_read_body_json(&app, req).await;
    assert_eq!(value, 1);

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/18/cleanup")
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());
    assert!(!backend.is_exported(79));
}

#[actix_rt::test]
async fn detected_edges_reach_history_and_flag() {
    let (state, backend, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/18/detect")
        .set_json(json!({ "edge": "rising" }))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());
    settle().await;

    let req = test::TestRequest::get().uri("/api/v1/channel/18").to_request();
    let desc: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(desc["events"]["edge"], "rising");
    assert_eq!(desc["events"]["detecting"], true);
    assert_eq!(desc["events"]["callbacks"], 1);

    backend.pulse(79);
    settle().await;

    let req = test::TestRequest::get()
        .uri("/api/v1/channel/18/events")
        .to_request();
    let events: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["channel"], "18");
    assert_eq!(events[0]["edge"], "rising");

    let req = test::TestRequest::get()
        .uri("/api/v1/channel/18/event")
        .to_request();
    let last: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(last["channel"], "18");

    let req = test::TestRequest::get()
        .uri("/api/v1/channel/18/detected")
        .to_request();
    let detected: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(detected["detected"], true);

    let req = test::TestRequest::get()
        .uri("/api/v1/channel/18/detected")
        .to_request();
    let detected: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(detected["detected"], false);

    let req = test::TestRequest::delete()
        .uri("/api/v1/channel/18/detect")
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());
}

#[actix_rt::test]
async fn repeated_detect_keeps_one_broadcast_callback() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    for _ in 0..2 {
        let req = test::TestRequest::post()
            .uri("/api/v1/channel/19/detect")
            .set_json(json!({ "edge": "both", "debounce_ms": 10 }))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
    }

    let req = test::TestRequest::get().uri("/api/v1/channel/19").to_request();
    let desc: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(desc["events"]["callbacks"], 1);
    assert_eq!(desc["events"]["debounce_ms"], 10);
}

#[actix_rt::test]
async fn invalid_detect_requests_report_codes() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/18/detect")
        .set_json(json!({ "edge": "none" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], -101);

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/18/detect")
        .set_json(json!({ "edge": "sideways" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], -102);

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/18/detect")
        .set_json(json!({ "edge": "rising" }))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/18/detect")
        .set_json(json!({ "edge": "falling" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], -107);

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/18/detect")
        .insert_header(("content-type", "application/json"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}

#[actix_rt::test]
async fn wait_times_out_without_edges() {
    let (state, backend, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/SPI_CS/wait")
        .set_json(json!({ "edge": "both", "timeout_ms": 60 }))
        .to_request();
    let outcome: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome["channel"], "SPI_CS");
    assert_eq!(outcome["detected"], false);
    assert_eq!(outcome["code"], 0);

    assert_eq!(backend.open_descriptors(12), 0);
    let req = test::TestRequest::get()
        .uri("/api/v1/channel/SPI_CS")
        .to_request();
    let desc: Value = test::call_and_read_body_json(&app, req).await;
    assert!(desc["events"].is_null());
}

#[actix_rt::test]
async fn events_limit_returns_latest() {
    let (state, backend, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/19/detect")
        .set_json(json!({ "edge": "both" }))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());
    settle().await;

    for value in [1, 0, 1, 0, 1, 0] {
        backend.set_value(80, value);
        settle().await;
    }

    let req = test::TestRequest::get()
        .uri("/api/v1/channel/19/events")
        .to_request();
    let events: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(events.len(), 4);

    let req = test::TestRequest::get()
        .uri("/api/v1/channel/19/events?limit=2")
        .to_request();
    let latest: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[1]["timestamp_ms"], events[3]["timestamp_ms"]);
}

#[actix_rt::test]
async fn cleanup_is_refused_while_wait_blocks() {
    let (state, backend, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let manager = state.manager.clone();
    let waiter =
        std::thread::spawn(move || manager.wait_for_edge("18", EdgeDetect::Rising, 0, 2000));
    settle().await;

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/18/cleanup")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], -106);
    assert_eq!(backend.edge(79), EdgeDetect::Rising);

    backend.pulse(79);
    let outcome = waiter.join().unwrap().unwrap();
    assert!(outcome.detected);

    let req = test::TestRequest::post()
        .uri("/api/v1/channel/18/cleanup")
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());
}
