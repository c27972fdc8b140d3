use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use civic_db::Database;
use civic_server::{ServerConfig, build_router, build_state};

const GOV_CODE: &str = "city-hall";

fn app() -> Router {
    let config = ServerConfig {
        jwt_secret: "rest-test-secret".into(),
        government_code: Some(GOV_CODE.into()),
        ..ServerConfig::default()
    };
    let db = Database::open_in_memory().unwrap();
    build_router(build_state(&config, db))
}

async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Register a user and return (user id, token).
async fn register(app: &Router, username: &str, government: bool) -> (String, String) {
    let body = if government {
        json!({ "username": username, "password": "password123", "role": "government", "governmentCode": GOV_CODE })
    } else {
        json!({ "username": username, "password": "password123" })
    };
    let (status, json) = call(app, Method::POST, "/auth/register", None, Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", json);
    (
        json["data"]["userId"].as_str().unwrap().to_string(),
        json["data"]["token"].as_str().unwrap().to_string(),
    )
}

async fn create_issue(app: &Router, token: &str, title: &str) -> String {
    let (status, json) = call(app, Method::POST, "/issues", Some(token), Some(json!({ "title": title }))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", json);
    json["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_public() {
    let app = app();
    let (status, json) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "success": true, "data": "ok" }));
}

#[tokio::test]
async fn protected_routes_need_a_valid_token() {
    let app = app();
    let (status, json) = call(&app, Method::GET, "/consent/pending", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["success"], false);

    let (status, _) = call(&app, Method::GET, "/consent/pending", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn accounts() {
    let app = app();
    register(&app, "ana", false).await;

    let (status, _) = call(
        &app,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({ "username": "ana", "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        &app,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({ "username": "mallory", "password": "password123", "role": "government", "governmentCode": "guess" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, json) = call(
        &app,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({ "username": "ana", "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["role"], "citizen");

    let (status, _) = call(
        &app,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({ "username": "ana", "password": "wrong-password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn racing_registrations_for_one_name() {
    let app = app();
    let body = json!({ "username": "ana", "password": "password123" });
    let (first, second) = tokio::join!(
        call(&app, Method::POST, "/auth/register", None, Some(body.clone())),
        call(&app, Method::POST, "/auth/register", None, Some(body)),
    );

    let mut statuses = vec![first.0, second.0];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::CONFLICT]);
    let loser = if first.0 == StatusCode::CONFLICT { first.1 } else { second.1 };
    assert_eq!(loser["error"], "username is taken");
}

#[tokio::test]
async fn chat_validation_and_pagination() {
    let app = app();
    let (_, ana) = register(&app, "ana", false).await;
    let issue = create_issue(&app, &ana, "Pothole").await;
    let chat = format!("/issues/{}/chat", issue);

    let (status, json) = call(&app, Method::POST, &chat, Some(&ana), Some(json!({ "message": "   " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);

    for i in 0..3 {
        let (status, json) = call(&app, Method::POST, &chat, Some(&ana), Some(json!({ "message": format!("m{}", i) }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["issueId"], issue.as_str());
    }

    let (status, json) = call(&app, Method::GET, &format!("{}?page=1&pageSize=2", chat), Some(&ana), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["pagination"], json!({ "page": 1, "pageSize": 2, "totalPages": 2 }));
    let bodies: Vec<&str> = json["data"].as_array().unwrap().iter().map(|m| m["body"].as_str().unwrap()).collect();
    assert_eq!(bodies, vec!["m1", "m2"]);

    let (status, _) = call(&app, Method::GET, &format!("{}?page=0", chat), Some(&ana), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::GET,
        &format!("/issues/{}/chat", uuid::Uuid::new_v4()),
        Some(&ana),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_requests_get_the_error_envelope() {
    let app = app();
    let (_, ana) = register(&app, "ana", false).await;
    let issue = create_issue(&app, &ana, "Pothole").await;

    let cases = [
        (Method::POST, format!("/issues/{}/chat", issue), Some(json!({ "message": 5 }))),
        (Method::POST, format!("/issues/{}/consent", issue), Some(json!({ "accept": "yes" }))),
        (Method::POST, "/issues/not-a-uuid/chat".to_string(), Some(json!({ "message": "hi" }))),
        (Method::GET, "/issues/not-a-uuid/permissions".to_string(), None),
        (Method::GET, format!("/issues/{}/chat?page=last", issue), None),
        (Method::POST, "/auth/login".to_string(), Some(json!({ "username": "ana" }))),
    ];
    for (method, uri, body) in cases {
        let (status, json) = call(&app, method, &uri, Some(&ana), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(json["success"], false, "{}", uri);
        assert!(json["error"].is_string(), "{}", uri);
    }

    let (status, json) = call(&app, Method::GET, "/nowhere", Some(&ana), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
}

/// U reports I1, it is merged into I2, U declines: U keeps reading but can
/// never write, while government keeps writing.
#[tokio::test]
async fn decline_flow_over_rest() {
    let app = app();
    let (_, mayor) = register(&app, "mayor", true).await;
    let (_, ana) = register(&app, "ana", false).await;
    let (_, ben) = register(&app, "ben", false).await;
    let i1 = create_issue(&app, &ana, "Flooded underpass").await;
    let i2 = create_issue(&app, &ben, "Underpass flooding").await;

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/issues/{}/merge", i1),
        Some(&ana),
        Some(json!({ "canonicalIssueId": i2 })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, json) = call(
        &app,
        Method::POST,
        &format!("/issues/{}/merge", i1),
        Some(&mayor),
        Some(json!({ "canonicalIssueId": i2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["canonicalIssueId"], i2.as_str());

    let (_, json) = call(&app, Method::GET, "/consent/pending", Some(&ana), None).await;
    assert_eq!(json["data"], json!([i1]));

    let (status, json) = call(&app, Method::GET, &format!("/issues/{}/permissions", i1), Some(&ana), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"], json!({ "canRead": true, "canWrite": false, "reason": "consentPending" }));

    let chat1 = format!("/issues/{}/chat", i1);
    let (status, _) = call(&app, Method::POST, &chat1, Some(&ana), Some(json!({ "message": "hi" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let consent1 = format!("/issues/{}/consent", i1);
    let (status, _) = call(&app, Method::POST, &consent1, Some(&ben), Some(json!({ "accept": true }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, json) = call(&app, Method::POST, &consent1, Some(&ana), Some(json!({ "accept": false }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"], json!({ "issueId": i1, "state": "denied" }));

    let (status, _) = call(&app, Method::POST, &consent1, Some(&ana), Some(json!({ "accept": false }))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::POST, &consent1, Some(&ana), Some(json!({ "accept": true }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&app, Method::POST, &chat1, Some(&ana), Some(json!({ "message": "hi" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/issues/{}/chat", i2),
        Some(&mayor),
        Some(json!({ "message": "crew dispatched" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, json) = call(&app, Method::GET, &chat1, Some(&ana), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"][0]["body"], "crew dispatched");
    assert_eq!(json["data"][0]["authorRole"], "government");

    let (_, json) = call(&app, Method::GET, &consent1, Some(&ana), None).await;
    assert_eq!(json["data"]["state"], "denied");
    let (_, json) = call(&app, Method::GET, "/consent/pending", Some(&ana), None).await;
    assert_eq!(json["data"], json!([]));
}
