//! Axum JSON API over the professor store and refresh pipeline.
//!
//! Thin transport layer: handlers validate inputs, call into storage or
//! the refresher, and shape responses. All ranking and grouping logic
//! lives below this crate.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use profrank_core::Canonicalizer;
use profrank_harvest::{
    GraphqlSource, HarvestPipeline, ProfessorSource, DEFAULT_REVIEW_LIMIT,
};
use profrank_storage::{ProfessorFilter, SortKey, Store};
use profrank_sync::{RefreshConfig, RefreshError, Refresher};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "profrank-web";

pub struct AppState<S> {
    pub store: Store,
    pub canon: Arc<Canonicalizer>,
    pub refresher: Arc<Refresher<S>>,
    pub source: Arc<S>,
    pub review_limit: u32,
}

pub fn app<S: ProfessorSource + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/api/scrape", post(scrape_handler::<S>))
        .route("/api/rankings", get(rankings_handler::<S>))
        .route("/api/departments", get(departments_handler::<S>))
        .route("/api/stats", get(stats_handler::<S>))
        .route("/api/department-stats", get(department_stats_handler::<S>))
        .route("/api/schedule", post(schedule_handler::<S>))
        .route("/api/professor/{source_id}/reviews", get(reviews_handler::<S>))
        .with_state(Arc::new(state))
}

/// Wire the production state together from environment config.
pub async fn state_from_config(config: &RefreshConfig) -> anyhow::Result<AppState<GraphqlSource>> {
    let store = Store::connect(&config.database_url).await?;
    let canon = Arc::new(Canonicalizer::from_reference_file(&config.reference_file));
    let source = Arc::new(GraphqlSource::new(&config.source_config())?);
    let pipeline = HarvestPipeline::new(Arc::clone(&source));
    let refresher = Arc::new(Refresher::new(store.clone(), pipeline));
    Ok(AppState {
        store,
        canon,
        refresher,
        source,
        review_limit: DEFAULT_REVIEW_LIMIT,
    })
}

pub fn port_from_env() -> u16 {
    std::env::var("PROFRANK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState<GraphqlSource>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct ScrapeQuery {
    force: Option<bool>,
}

/// Trigger a harvest. A no-op while the cached dataset is fresh unless
/// forced; an overlapping trigger is rejected with 409 rather than queued.
async fn scrape_handler<S: ProfessorSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<ScrapeQuery>,
) -> Response {
    if !query.force.unwrap_or(false) {
        match state.store.is_fresh().await {
            Ok(true) => {
                return match state.store.global_stats(&state.canon).await {
                    Ok(stats) => Json(json!({
                        "status": "cached",
                        "message": "Data is fresh, no scrape needed.",
                        "stats": stats,
                    }))
                    .into_response(),
                    Err(err) => internal_error(err.into()),
                };
            }
            Ok(false) => {}
            Err(err) => return internal_error(err.into()),
        }
    }

    match state.refresher.run_once().await {
        Ok(outcome) => match state.store.global_stats(&state.canon).await {
            Ok(stats) => Json(json!({
                "status": "completed",
                "message": format!("Scraped {} professors.", outcome.total_records),
                "stats": stats,
            }))
            .into_response(),
            Err(err) => internal_error(err.into()),
        },
        Err(RefreshError::Busy) => (
            StatusCode::CONFLICT,
            Json(json!({"detail": "A harvest run is already in progress."})),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "on-demand scrape failed");
            internal_error(anyhow::anyhow!("Scrape failed: {err}"))
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RankingsQuery {
    sort_by: Option<String>,
    department: Option<String>,
    min_ratings: Option<i64>,
}

async fn rankings_handler<S: ProfessorSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<RankingsQuery>,
) -> Response {
    let filter = ProfessorFilter {
        department: query.department,
        sort: SortKey::parse(query.sort_by.as_deref().unwrap_or("weighted_score")),
        min_ratings: query.min_ratings.unwrap_or(5).max(0),
    };
    match state.store.list_professors(&state.canon, &filter).await {
        Ok(professors) => Json(json!({
            "total": professors.len(),
            "professors": professors,
        }))
        .into_response(),
        Err(err) => internal_error(err.into()),
    }
}

async fn departments_handler<S: ProfessorSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Response {
    match state.store.departments(&state.canon).await {
        Ok(departments) => Json(json!({"departments": departments})).into_response(),
        Err(err) => internal_error(err.into()),
    }
}

async fn stats_handler<S: ProfessorSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Response {
    match state.store.global_stats(&state.canon).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => internal_error(err.into()),
    }
}

async fn department_stats_handler<S: ProfessorSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Response {
    match state.store.department_stats(&state.canon).await {
        Ok(departments) => Json(json!({"departments": departments})).into_response(),
        Err(err) => internal_error(err.into()),
    }
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    courses: Vec<String>,
}

async fn schedule_handler<S: ProfessorSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(request): Json<ScheduleRequest>,
) -> Response {
    if request.courses.is_empty() || request.courses.len() > 20 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Provide between 1 and 20 course codes."})),
        )
            .into_response();
    }
    match state
        .store
        .professors_by_courses(&state.canon, &request.courses)
        .await
    {
        Ok(results) => Json(json!({"results": results})).into_response(),
        Err(err) => internal_error(err.into()),
    }
}

async fn reviews_handler<S: ProfessorSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(source_id): Path<i64>,
) -> Response {
    match state.source.recent_reviews(source_id, state.review_limit).await {
        Ok(reviews) => Json(json!({"reviews": reviews})).into_response(),
        Err(err) => {
            error!(error = %err, source_id, "review fetch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": "Failed to fetch reviews"})),
            )
                .into_response()
        }
    }
}

fn internal_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use profrank_core::{CourseEntry, ProfessorRecord, Review};
    use profrank_harvest::{HarvestError, SearchPage};
    use tower::ServiceExt;

    struct FakeSource;

    #[async_trait]
    impl ProfessorSource for FakeSource {
        async fn search_page(
            &self,
            query_text: &str,
            _cursor: Option<&str>,
        ) -> Result<SearchPage, HarvestError> {
            let records = if query_text == "a" {
                vec![professor(99, "Harvested", "Physics")]
            } else {
                vec![]
            };
            Ok(SearchPage {
                records,
                has_next_page: false,
                end_cursor: None,
            })
        }

        async fn recent_reviews(
            &self,
            source_id: i64,
            _limit: u32,
        ) -> Result<Vec<Review>, HarvestError> {
            if source_id == 42 {
                Ok(vec![Review {
                    comment: "clear lectures".to_string(),
                    class_name: "CS101".to_string(),
                    date: "2026-01-15".to_string(),
                    quality: Some(5.0),
                    difficulty: Some(2.0),
                    grade: "A".to_string(),
                    would_take_again: Some(true),
                    tags: "Caring".to_string(),
                    thumbs_up: 2,
                    thumbs_down: 0,
                }])
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn professor(source_id: i64, last_name: &str, department: &str) -> ProfessorRecord {
        ProfessorRecord {
            source_id,
            first_name: "Test".to_string(),
            last_name: last_name.to_string(),
            department: department.to_string(),
            raw_department: department.to_string(),
            avg_rating: Some(4.0),
            avg_difficulty: Some(2.0),
            would_take_again_pct: Some(80.0),
            num_ratings: 10,
            tags: vec![],
            courses: vec![CourseEntry {
                name: "CS 101".to_string(),
                count: 3,
            }],
        }
    }

    async fn test_app(records: &[ProfessorRecord]) -> Router {
        let store = Store::in_memory().await.unwrap();
        if !records.is_empty() {
            store.replace_all(records, Utc::now()).await.unwrap();
        }
        let source = Arc::new(FakeSource);
        let pipeline = HarvestPipeline::new(Arc::clone(&source))
            .with_page_delay(std::time::Duration::from_millis(0));
        let refresher = Arc::new(Refresher::new(store.clone(), pipeline));
        app(AppState {
            store,
            canon: Arc::new(Canonicalizer::empty()),
            refresher,
            source,
            review_limit: DEFAULT_REVIEW_LIMIT,
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn rankings_rank_professors_in_order() {
        let mut low = professor(1, "Low", "Biology");
        low.avg_rating = Some(2.5);
        low.would_take_again_pct = Some(30.0);
        let app = test_app(&[low, professor(2, "High", "Biology")]).await;

        let resp = app.oneshot(get_request("/api/rankings")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["professors"][0]["last_name"], "High");
        assert_eq!(body["professors"][0]["rank"], 1);
        assert_eq!(body["professors"][1]["rank"], 2);
    }

    #[tokio::test]
    async fn rankings_default_min_ratings_hides_thin_profiles() {
        let mut thin = professor(1, "Thin", "Biology");
        thin.num_ratings = 3;
        let app = test_app(&[thin, professor(2, "Solid", "Biology")]).await;

        let resp = app.oneshot(get_request("/api/rankings")).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["professors"][0]["last_name"], "Solid");
    }

    #[tokio::test]
    async fn departments_endpoint_lists_merged_names() {
        let app = test_app(&[
            professor(1, "A", "Math & Stats"),
            professor(2, "B", "Math and Stats"),
        ])
        .await;
        let resp = app.oneshot(get_request("/api/departments")).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["departments"], json!(["Math & Stats"]));
    }

    #[tokio::test]
    async fn stats_endpoint_reports_totals() {
        let app = test_app(&[professor(1, "A", "Biology")]).await;
        let resp = app.oneshot(get_request("/api/stats")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["total_professors"], 1);
    }

    #[tokio::test]
    async fn department_stats_endpoint_smoke() {
        let app = test_app(&[professor(1, "A", "Biology")]).await;
        let resp = app
            .oneshot(get_request("/api/department-stats"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["departments"][0]["name"], "Biology");
    }

    #[tokio::test]
    async fn schedule_rejects_empty_and_oversized_batches() {
        let app = test_app(&[]).await;
        let resp = app
            .clone()
            .oneshot(post_json("/api/schedule", json!({"courses": []})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let too_many: Vec<String> = (0..21).map(|i| format!("CS{i}")).collect();
        let resp = app
            .oneshot(post_json("/api/schedule", json!({"courses": too_many})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn schedule_groups_professors_by_course() {
        let app = test_app(&[professor(1, "Teach", "Computer Science")]).await;
        let resp = app
            .oneshot(post_json("/api/schedule", json!({"courses": ["cs 101"]})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["results"]["CS101"][0]["last_name"], "Teach");
        assert_eq!(body["results"]["CS101"][0]["rank"], 1);
    }

    #[tokio::test]
    async fn scrape_is_a_no_op_while_fresh() {
        let app = test_app(&[professor(1, "A", "Biology")]).await;
        let resp = app.oneshot(post_json("/api/scrape", json!({}))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "cached");
        assert_eq!(body["stats"]["total_professors"], 1);
    }

    #[tokio::test]
    async fn forced_scrape_replaces_the_dataset() {
        let app = test_app(&[professor(1, "Old", "Biology")]).await;
        let resp = app
            .oneshot(post_json("/api/scrape?force=true", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["message"], "Scraped 1 professors.");
        assert_eq!(body["stats"]["total_professors"], 1);
    }

    #[tokio::test]
    async fn reviews_endpoint_passes_through_the_source() {
        let app = test_app(&[]).await;
        let resp = app
            .clone()
            .oneshot(get_request("/api/professor/42/reviews"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["reviews"][0]["class_name"], "CS101");

        let resp = app
            .oneshot(get_request("/api/professor/7/reviews"))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["reviews"], json!([]));
    }
}
