use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt as _;

use ficrec::model::{Site, Story, StoryKey, User, UserKey};
use ficrec::recommend::RecommendationEngine;
use ficrec::sites::{SiteRegistry, SiteUrls};
use ficrec::store::{EntityStore as _, MemoryEntityStore};

async fn app() -> axum::Router {
    let store = Arc::new(MemoryEntityStore::new());
    for id in [100, 200, 300] {
        let mut story = Story::new(StoryKey::new(Site::Ao3, id));
        story.exists = true;
        story.title = format!("Work {id}");
        store.upsert(story.into()).await.unwrap();
    }
    for (name, favorites) in [("u1", vec![100, 200]), ("u2", vec![100, 200, 300])] {
        let mut user = User::new(UserKey::new(Site::Ao3, name));
        user.exists = true;
        user.favorite_stories = favorites
            .into_iter()
            .map(|id| StoryKey::new(Site::Ao3, id))
            .collect();
        store.upsert(user.into()).await.unwrap();
    }

    let engine = RecommendationEngine::new(
        store,
        SiteRegistry::standard(SiteUrls::public().unwrap()),
    );
    ficrec::api::router(engine, None)
}

async fn get(uri: &str) -> (StatusCode, Option<String>, String) {
    let response = app()
        .await
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_owned());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

const WORK_100: &str = "https%3A%2F%2Farchiveofourown.org%2Fworks%2F100";

#[tokio::test]
async fn returns_ranked_stories_as_json() {
    let (status, content_type, body) =
        get(&format!("/api/v1/recommendation?id={WORK_100}&limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/json"));

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["Stories"][0]["Id"], 200);
    assert_eq!(json["Stories"][0]["Score"], 2);
    assert_eq!(json["Stories"][1]["Id"], 300);
    assert_eq!(json["Stats"]["StoryCount"], 2);
    assert_eq!(json["Story"]["Id"], 100);
}

#[tokio::test]
async fn paginates() {
    let (status, _, body) =
        get(&format!("/api/v1/recommendation?id={WORK_100}&limit=1&offset=1")).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let stories = json["Stories"].as_array().unwrap();
    assert_eq!(stories.len(), 1);
    assert_eq!(stories[0]["Id"], 300);
}

#[tokio::test]
async fn wraps_jsonp_callbacks_as_plain_text() {
    let (status, content_type, body) =
        get(&format!("/api/v1/recommendation?id={WORK_100}&callback=handleRecs")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/plain"));
    assert!(body.starts_with("handleRecs({"));
    assert!(body.ends_with("})"));
}

#[tokio::test]
async fn rejects_out_of_range_paging() {
    let (status, _, body) =
        get(&format!("/api/v1/recommendation?id={WORK_100}&limit=201")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("limit must be"));

    let (status, _, body) =
        get(&format!("/api/v1/recommendation?id={WORK_100}&offset=-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("offset must be"));
}

#[tokio::test]
async fn unparseable_paging_uses_defaults() {
    let (status, _, body) =
        get(&format!("/api/v1/recommendation?id={WORK_100}&limit=lots&offset=x")).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["Stories"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn rejects_script_callbacks() {
    let (status, _, _) = get(&format!(
        "/api/v1/recommendation?id={WORK_100}&callback=alert(1)"
    ))
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_story_is_not_found() {
    let (status, _, body) =
        get("/api/v1/recommendation?id=https%3A%2F%2Farchiveofourown.org%2Fworks%2F9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("not found"));

    let (status, _, _) = get("/api/v1/recommendation").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn allows_any_origin() {
    let response = app()
        .await
        .oneshot(
            Request::get(format!("/api/v1/recommendation?id={WORK_100}"))
                .header(header::ORIGIN, "https://reader.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
}

#[tokio::test]
async fn health_check() {
    let (status, _, body) = get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok\n");
}
