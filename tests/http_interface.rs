mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::Harness;
use payrecon::domain::provider::Provider;
use payrecon::error::PaymentError;
use payrecon::interfaces::http::router;
use serde_json::{Value, json};
use tower::ServiceExt;

async fn send(h: &Harness, request: Request<Body>) -> (StatusCode, Value) {
    let response = router(h.service.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn webhook(h: &Harness, provider: &str, body: Vec<u8>, signed: bool) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{provider}"))
        .header("content-type", "application/json");
    if signed {
        for (name, value) in h.provider.sign(&body).iter() {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(body)).unwrap()
}

async fn place_and_checkout(h: &Harness) -> (String, String) {
    let (status, order) = send(h, post_json("/orders", json!({ "amount": 2599, "currency": "usd" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let order_id = order["id"].as_str().unwrap().to_string();

    let (status, session) = send(
        h,
        post_json(
            &format!("/orders/{order_id}/payments"),
            json!({ "provider": "card_wallet", "return_url": "https://shop.example/done" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["status"], "pending");
    assert!(session["redirect_target"].is_string());
    (order_id, session["provider_ref"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new(Provider::CardWallet);
    let (status, body) = send(&h, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok", "providers": ["card_wallet"] }));
}

#[tokio::test]
async fn test_cancel_endpoint() {
    let h = Harness::new(Provider::CardWallet);
    let (_, order) = send(&h, post_json("/orders", json!({ "amount": 300, "currency": "EUR" }))).await;
    let order_id = order["id"].as_str().unwrap();

    let (status, cancelled) = send(
        &h,
        post_json(&format!("/orders/{order_id}/cancel"), json!({ "reason": "customer left" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["history"][0]["reason"], "customer left");

    let (status, body) = send(
        &h,
        post_json(&format!("/orders/{order_id}/payments"), json!({ "provider": "card_wallet" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "payment_conflict");
}

#[tokio::test]
async fn test_order_lifecycle_over_http() {
    let h = Harness::new(Provider::CardWallet);
    let (order_id, provider_ref) = place_and_checkout(&h).await;

    let body = common::event_body(Provider::CardWallet, &provider_ref, "COMPLETED");
    let (status, answer) = send(&h, webhook(&h, "card_wallet", body, true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answer["outcome"], "applied");

    let (status, view) = send(&h, get(&format!("/orders/{order_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["order"]["status"], "paid");
    assert_eq!(view["order"]["currency"], "USD");
    assert_eq!(view["payments"].as_array().unwrap().len(), 1);
    assert_eq!(view["payments"][0]["status"], "completed");
    assert_eq!(view["payments"][0]["provider_ref"], provider_ref.as_str());
    assert!(view["payments"][0].get("last_provider_payload").is_none());

    let (status, refund) = send(&h, post_json(&format!("/orders/{order_id}/refund"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refund["refund"], "completed");
    assert_eq!(refund["order"]["status"], "refunded");
    assert_eq!(refund["payment"]["status"], "refunded");
    assert!(refund["payment"].get("last_provider_payload").is_none());
}

#[tokio::test]
async fn test_webhook_status_codes() {
    let h = Harness::new(Provider::CardWallet);
    let (_, provider_ref) = place_and_checkout(&h).await;
    let body = common::event_body(Provider::CardWallet, &provider_ref, "COMPLETED");

    let (status, answer) = send(&h, webhook(&h, "card_wallet", body.clone(), false)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(answer["error"], "bad_signature");

    let (status, _) = send(&h, webhook(&h, "card_wallet", b"{not json".to_vec(), true)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h, webhook(&h, "paypal", body.clone(), true)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&h, webhook(&h, "mobile_money", body.clone(), true)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Classified but not applied still acknowledges delivery.
    let unknown = common::event_body(Provider::CardWallet, "CW-UNKNOWN", "COMPLETED");
    let (status, answer) = send(&h, webhook(&h, "card_wallet", unknown, true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answer["outcome"], "rejected");

    let (status, answer) = send(&h, webhook(&h, "card_wallet", body.clone(), true)).await;
    assert_eq!((status, answer["outcome"].as_str()), (StatusCode::OK, Some("applied")));
    let (status, answer) = send(&h, webhook(&h, "card_wallet", body, true)).await;
    assert_eq!((status, answer["outcome"].as_str()), (StatusCode::OK, Some("ignored")));
}

#[tokio::test]
async fn test_errors_use_public_kinds() {
    let h = Harness::new(Provider::CardWallet);

    let (status, body) = send(&h, get("/orders/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "invalid_request" }));

    let (status, body) = send(&h, get(&format!("/orders/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = send(&h, post_json("/orders", json!({ "amount": 0, "currency": "USD" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");

    let (_, order) = send(&h, post_json("/orders", json!({ "amount": 100, "currency": "USD" }))).await;
    let order_id = order["id"].as_str().unwrap();

    let (status, body) = send(
        &h,
        post_json(&format!("/orders/{order_id}/refund"), json!({ "amount": 50 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "payment_conflict");

    h.provider.script_create(Err(PaymentError::ProviderRejected {
        provider: Provider::CardWallet,
        reason: "INSTRUMENT_DECLINED: card 4111 1111 1111 1111".to_string(),
    }));
    let (status, body) = send(
        &h,
        post_json(&format!("/orders/{order_id}/payments"), json!({ "provider": "card_wallet" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body, json!({ "error": "payment_rejected" }));

    for _ in 0..3 {
        h.provider
            .script_create(Err(PaymentError::ProviderTimeout { provider: Provider::CardWallet }));
    }
    let (status, body) = send(
        &h,
        post_json(&format!("/orders/{order_id}/payments"), json!({ "provider": "card_wallet" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "payment_unavailable");

    let (status, body) = send(
        &h,
        post_json(&format!("/orders/{order_id}/payments"), json!({ "provider": "bank_transfer" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_capture_endpoint() {
    let h = Harness::new(Provider::CardWallet);
    let (order_id, provider_ref) = place_and_checkout(&h).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/payments/card_wallet/{provider_ref}/capture"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["order"]["id"], order_id.as_str());
    assert_eq!(body["order"]["status"], "paid");
    assert_eq!(body["payment"]["status"], "completed");
    assert!(body["payment"].get("last_provider_payload").is_none());

    let request = Request::builder()
        .method("POST")
        .uri("/payments/card_wallet/CW-NOPE/capture")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["outcome"], "rejected");
    assert_eq!(body["detail"]["reason"], "unknown_provider_ref");
}
