use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::test::{self, TestRequest};
use actix_web::{web, App};
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use adfleet::config::{GatewayConfig, RetryConfig};
use adfleet::database::MemoryDatabase;
use adfleet::evidence::MemoryEvidenceStore;
use adfleet::gateway::{HttpPaymentGateway, SIGNATURE_HEADER};
use adfleet::notification::{LogNotifier, Notifications};
use adfleet::proof::ProofPeriod;
use adfleet::user::{UserId, USER_ID_HEADER, USER_ROLE_HEADER};
use adfleet::{configure, path_not_found, Services};

fn services() -> Services {
    let retry = RetryConfig {
        min_delay_ms: 1,
        max_delay_ms: 2,
        max_attempts: 2,
    };

    Services {
        db: Arc::new(MemoryDatabase::new()),
        gateway: Arc::new(HttpPaymentGateway::new(&GatewayConfig::default()).unwrap()),
        evidence: Arc::new(MemoryEvidenceStore::new()),
        notifications: Arc::new(Notifications::new(Arc::new(LogNotifier), retry.clone())),
        retry,
        max_upload_bytes: 1024,
    }
}

fn as_user(request: TestRequest, user_id: UserId, role: &str) -> TestRequest {
    request
        .insert_header((USER_ID_HEADER, user_id.to_string()))
        .insert_header((USER_ROLE_HEADER, role))
}

fn campaign_details() -> Value {
    json!({
        "name": "Spring launch",
        "package_type": "basic",
        "price": 10_000,
        "drivers_requested": 2,
        "earning_per_driver": 4_000,
        "start_date": Utc::now() + Duration::minutes(5),
        "duration_days": 28,
    })
}

fn id_of(body: &Value) -> String {
    body["id"].as_str().unwrap().to_string()
}

#[actix_rt::test]
async fn requests_without_identity_are_unauthorized() {
    let services = services();
    let app = test::init_service(
        App::new()
            .configure(|cfg| configure(cfg, &services))
            .default_service(web::to(path_not_found)),
    )
    .await;

    let response = test::call_service(&app, TestRequest::get().uri("/campaigns").to_request()).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(response).await;
    assert_eq!(body["error_code"], "E4011000");
}

#[actix_rt::test]
async fn unknown_paths_use_the_error_format() {
    let services = services();
    let app = test::init_service(
        App::new()
            .configure(|cfg| configure(cfg, &services))
            .default_service(web::to(path_not_found)),
    )
    .await;

    let response = test::call_service(&app, TestRequest::get().uri("/nowhere").to_request()).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(response).await;
    assert_eq!(body["error_code"], "E4041000");
}

#[actix_rt::test]
async fn drivers_cannot_review_campaigns() {
    let services = services();
    let app = test::init_service(
        App::new()
            .configure(|cfg| configure(cfg, &services))
            .default_service(web::to(path_not_found)),
    )
    .await;
    let owner_id = UserId::new();

    let request = as_user(TestRequest::post().uri("/campaigns"), owner_id, "business_owner")
        .set_json(campaign_details())
        .to_request();
    let campaign: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(campaign["status"], "pending");

    let request = as_user(
        TestRequest::post().uri(&format!("/campaigns/{}/review", id_of(&campaign))),
        UserId::new(),
        "driver",
    )
    .set_json(json!({ "decision": "approve" }))
    .to_request();
    let response = test::call_service(&app, request).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[actix_rt::test]
async fn malformed_json_is_a_bad_request() {
    let services = services();
    let app = test::init_service(
        App::new()
            .configure(|cfg| configure(cfg, &services))
            .default_service(web::to(path_not_found)),
    )
    .await;

    let request = as_user(TestRequest::post().uri("/earnings"), UserId::new(), "driver")
        .insert_header(("content-type", "application/json"))
        .set_payload("{ \"amount\": ")
        .to_request();
    let response = test::call_service(&app, request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(response).await;
    assert_eq!(body["error_code"], "E4001000");
}

#[actix_rt::test]
async fn unsigned_webhooks_are_rejected() {
    let services = services();
    let app = test::init_service(
        App::new()
            .configure(|cfg| configure(cfg, &services))
            .default_service(web::to(path_not_found)),
    )
    .await;

    let request = TestRequest::post()
        .uri("/payments/webhook")
        .insert_header((SIGNATURE_HEADER, "deadbeef"))
        .set_payload(r#"{"event":"charge.success","data":{"reference":"ADF-1"}}"#)
        .to_request();
    let response = test::call_service(&app, request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(response).await;
    assert_eq!(body["error_code"], "E4001013");
}

#[actix_rt::test]
async fn campaign_to_payout() {
    let services = services();
    let app = test::init_service(
        App::new()
            .configure(|cfg| configure(cfg, &services))
            .default_service(web::to(path_not_found)),
    )
    .await;
    let admin_id = UserId::new();
    let owner_id = UserId::new();
    let driver_id = UserId::new();

    // the owner publishes a campaign and tops up
    let request = as_user(TestRequest::post().uri("/campaigns"), owner_id, "business_owner")
        .set_json(campaign_details())
        .to_request();
    let campaign: Value = test::call_and_read_body_json(&app, request).await;
    let campaign_id = id_of(&campaign);

    let request = as_user(
        TestRequest::post().uri(&format!("/accounts/{}/credits", owner_id)),
        admin_id,
        "admin",
    )
    .set_json(json!({ "amount": 10_000 }))
    .to_request();
    let account: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(account["balance"], 10_000);

    let request = as_user(
        TestRequest::post().uri(&format!("/campaigns/{}/review", campaign_id)),
        admin_id,
        "admin",
    )
    .set_json(json!({ "decision": "approve" }))
    .to_request();
    let campaign: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(campaign["status"], "approved");

    let request = as_user(
        TestRequest::post().uri(&format!("/campaigns/{}/payment/balance", campaign_id)),
        owner_id,
        "business_owner",
    )
    .to_request();
    let campaign: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(campaign["payment_status"], "spent");

    // a driver joins and gets approved
    let request = as_user(
        TestRequest::post().uri(&format!("/campaigns/{}/assignments", campaign_id)),
        driver_id,
        "driver",
    )
    .to_request();
    let assignment: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(assignment["status"], "pending_approval");

    let request = as_user(
        TestRequest::post().uri(&format!("/assignments/{}/decision", id_of(&assignment))),
        admin_id,
        "admin",
    )
    .set_json(json!({ "decision": "approve" }))
    .to_request();
    let assignment: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(assignment["status"], "approved");

    // weekly proofs wait for the installment proof
    let start = campaign["terms"]["start_date"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let period = ProofPeriod::of(start);
    let weekly_uri = format!(
        "/campaigns/{}/weekly-proofs/{}/{}",
        campaign_id, period.year, period.week
    );

    let request = as_user(TestRequest::put().uri(&weekly_uri), driver_id, "driver")
        .insert_header(("content-type", "image/jpeg"))
        .set_payload(b"week one".to_vec())
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let request = as_user(
        TestRequest::put().uri(&format!("/campaigns/{}/installment-proof", campaign_id)),
        driver_id,
        "driver",
    )
    .insert_header(("content-type", "image/jpeg"))
    .set_payload(b"installed".to_vec())
    .to_request();
    let proof: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(proof["status"], "pending_approval");

    let request = as_user(TestRequest::get().uri("/installment-proofs"), admin_id, "admin")
        .to_request();
    let pending: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);

    let request = as_user(
        TestRequest::post().uri(&format!("/installment-proofs/{}/review", id_of(&proof))),
        admin_id,
        "admin",
    )
    .set_json(json!({ "decision": "approve" }))
    .to_request();
    let proof: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(proof["status"], "approved");

    let request = as_user(TestRequest::put().uri(&weekly_uri), driver_id, "driver")
        .insert_header(("content-type", "image/jpeg"))
        .set_payload(b"week one".to_vec())
        .to_request();
    let weekly: Value = test::call_and_read_body_json(&app, request).await;

    let request = as_user(
        TestRequest::post().uri(&format!("/weekly-proofs/{}/review", id_of(&weekly))),
        admin_id,
        "admin",
    )
    .set_json(json!({ "decision": "approve" }))
    .to_request();
    let weekly: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(weekly["status"], "approved");
    let accrued = weekly["accrued"].as_i64().unwrap();
    assert!(accrued > 0);

    // accrued earnings stay pending until the assignment completes
    let request = as_user(TestRequest::get().uri("/accounts/me"), driver_id, "driver").to_request();
    let account: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(account["pending"].as_i64().unwrap(), accrued);
    assert_eq!(account["balance"], 0);

    let request = as_user(TestRequest::post().uri("/earnings"), driver_id, "driver")
        .set_json(json!({
            "amount": 500,
            "method": "mobile_money",
            "recipient_reference": "RCP_driver",
        }))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = test::read_body_json(response).await;
    assert_eq!(body["error_code"], "E4221010");

    // a top-up makes the payout possible
    let request = as_user(
        TestRequest::post().uri(&format!("/accounts/{}/credits", driver_id)),
        admin_id,
        "admin",
    )
    .set_json(json!({ "amount": 1_000 }))
    .to_request();
    test::call_and_read_body_json::<_, _, Value>(&app, request).await;

    let request = as_user(TestRequest::post().uri("/earnings"), driver_id, "driver")
        .set_json(json!({
            "amount": 500,
            "method": "mobile_money",
            "recipient_reference": "RCP_driver",
        }))
        .to_request();
    let earning: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(earning["approval"], "UNAPPROVED");

    let request = as_user(TestRequest::get().uri("/earnings"), admin_id, "admin").to_request();
    let unapproved: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(unapproved.as_array().unwrap().len(), 1);

    let request = as_user(
        TestRequest::post().uri(&format!("/drivers/{}/earnings/approve", driver_id)),
        admin_id,
        "admin",
    )
    .set_json(json!({ "recipient_reference": "RCP_driver" }))
    .to_request();
    let earning: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(earning["approval"], "APPROVED");
    assert_eq!(earning["payment"], "PAID");

    let request = as_user(TestRequest::get().uri("/earnings/dashboard"), driver_id, "driver")
        .to_request();
    let dashboard: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(dashboard["available_balance"], 500);
    assert_eq!(dashboard["total_paid_out"], 500);
    assert_eq!(
        dashboard["total_earnings"].as_i64().unwrap(),
        1_000 + accrued
    );
}

#[actix_rt::test]
async fn oversized_evidence_is_refused() {
    let services = services();
    let app = test::init_service(
        App::new()
            .configure(|cfg| configure(cfg, &services))
            .default_service(web::to(path_not_found)),
    )
    .await;
    let campaign_id = "CPN-16E77539-8873-4C8A-BCA3-2036010474AD";

    let request = as_user(
        TestRequest::put().uri(&format!("/campaigns/{}/installment-proof", campaign_id)),
        UserId::new(),
        "driver",
    )
    .insert_header(("content-type", "image/jpeg"))
    .set_payload(vec![0u8; 4096])
    .to_request();
    let response = test::call_service(&app, request).await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
