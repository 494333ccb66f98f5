//! Ratings-source client and the concurrent harvest pipeline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use profrank_core::{
    resolve_subdepartment, CourseEntry, ProfessorRecord, Review, TagCount, UNKNOWN_DEPARTMENT,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, ORIGIN, REFERER};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "profrank-harvest";

/// Professors fetched per search page.
pub const PAGE_SIZE: u32 = 20;

/// In-flight page requests allowed across all partitions.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Pause between successive pages within one partition, to stay under the
/// source's rate limits.
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(100);

/// Reviews fetched by the single-shot review lookup.
pub const DEFAULT_REVIEW_LIMIT: u32 = 20;

const SEARCH_QUERY: &str = r#"
query TeacherSearchPaginationQuery(
    $count: Int!
    $cursor: String
    $query: TeacherSearchQuery!
) {
    search: newSearch {
        teachers(query: $query, first: $count, after: $cursor) {
            didFallback
            edges {
                cursor
                node {
                    id
                    legacyId
                    firstName
                    lastName
                    department
                    avgRating
                    avgDifficulty
                    wouldTakeAgainPercent
                    numRatings
                    teacherRatingTags {
                        tagName
                        tagCount
                    }
                    courseCodes {
                        courseName
                        courseCount
                    }
                }
            }
            pageInfo {
                hasNextPage
                endCursor
            }
            resultCount
        }
    }
}
"#;

const RATINGS_QUERY: &str = r#"
query RatingsListQuery($id: ID!, $count: Int!, $cursor: String) {
    node(id: $id) {
        ... on Teacher {
            ratings(first: $count, after: $cursor) {
                edges {
                    node {
                        comment
                        class
                        date
                        helpfulRating
                        difficultyRating
                        grade
                        wouldTakeAgain
                        ratingTags
                        thumbsUpTotal
                        thumbsDownTotal
                    }
                }
                pageInfo {
                    hasNextPage
                    endCursor
                }
            }
        }
    }
}
"#;

/// Connection settings for the upstream ratings source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub endpoint: String,
    pub school_id: i64,
    pub auth_token: String,
    pub referer: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://www.ratemyprofessors.com/graphql".to_string(),
            school_id: 877,
            // The source accepts a fixed public token for read access.
            auth_token: "Basic dGVzdDp0ZXN0".to_string(),
            referer: "https://www.ratemyprofessors.com".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .to_string(),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Linear retry schedule: attempt N sleeps N times the step before the
/// next try. Three attempts with a 1s step waits 1s then 2s.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub step: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_after_attempt(&self, attempt_index: usize) -> Duration {
        self.step.saturating_mul(attempt_index as u32 + 1)
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("request to ratings source failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ratings source returned http status {status}")]
    HttpStatus { status: u16 },
    #[error("malformed payload from ratings source: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("harvest worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// One page of search results, already normalized into records.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub records: Vec<ProfessorRecord>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// Seam between the pipeline and the wire. The production implementation
/// talks GraphQL over HTTP; tests script pages in process.
#[async_trait]
pub trait ProfessorSource: Send + Sync {
    async fn search_page(
        &self,
        query_text: &str,
        cursor: Option<&str>,
    ) -> Result<SearchPage, HarvestError>;

    async fn recent_reviews(
        &self,
        source_id: i64,
        limit: u32,
    ) -> Result<Vec<Review>, HarvestError>;
}

// --- Wire types -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchData {
    search: SearchNode,
}

#[derive(Debug, Deserialize)]
struct SearchNode {
    teachers: TeacherConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeacherConnection {
    edges: Vec<TeacherEdge>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct TeacherEdge {
    node: TeacherNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeacherNode {
    legacy_id: i64,
    first_name: String,
    last_name: String,
    department: Option<String>,
    avg_rating: Option<f64>,
    avg_difficulty: Option<f64>,
    would_take_again_percent: Option<f64>,
    num_ratings: i64,
    teacher_rating_tags: Option<Vec<RawTag>>,
    course_codes: Option<Vec<RawCourse>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTag {
    tag_name: String,
    tag_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCourse {
    course_name: String,
    course_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RatingsData {
    node: Option<RatingsTeacherNode>,
}

#[derive(Debug, Deserialize)]
struct RatingsTeacherNode {
    ratings: Option<RatingsConnection>,
}

#[derive(Debug, Deserialize)]
struct RatingsConnection {
    edges: Vec<RatingEdge>,
}

#[derive(Debug, Deserialize)]
struct RatingEdge {
    node: RatingNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RatingNode {
    comment: Option<String>,
    #[serde(rename = "class")]
    class_name: Option<String>,
    date: Option<String>,
    helpful_rating: Option<f64>,
    difficulty_rating: Option<f64>,
    grade: Option<String>,
    would_take_again: Option<serde_json::Value>,
    rating_tags: Option<String>,
    thumbs_up_total: Option<i64>,
    thumbs_down_total: Option<i64>,
}

fn record_from_node(node: TeacherNode) -> ProfessorRecord {
    let mut tags: Vec<TagCount> = node
        .teacher_rating_tags
        .unwrap_or_default()
        .into_iter()
        .filter(|t| t.tag_count > 0)
        .map(|t| TagCount {
            name: t.tag_name,
            count: t.tag_count,
        })
        .collect();
    tags.sort_by(|a, b| b.count.cmp(&a.count));
    tags.truncate(5);

    let all_courses: Vec<CourseEntry> = node
        .course_codes
        .unwrap_or_default()
        .into_iter()
        .map(|c| CourseEntry {
            name: c.course_name,
            count: c.course_count,
        })
        .collect();

    let raw_department = match node.department {
        Some(d) if !d.is_empty() => d,
        _ => UNKNOWN_DEPARTMENT.to_string(),
    };
    // Resolution sees the full course list; zero-count entries carry no
    // weight but keep the first-seen prefix order intact.
    let department = resolve_subdepartment(&raw_department, &all_courses);

    let mut courses: Vec<CourseEntry> = all_courses
        .into_iter()
        .filter(|c| c.count > 0)
        .collect();
    courses.sort_by(|a, b| b.count.cmp(&a.count));
    courses.truncate(10);

    ProfessorRecord {
        source_id: node.legacy_id,
        first_name: node.first_name,
        last_name: node.last_name,
        department,
        raw_department,
        avg_rating: node.avg_rating,
        avg_difficulty: node.avg_difficulty,
        would_take_again_pct: node.would_take_again_percent,
        num_ratings: node.num_ratings,
        tags,
        courses,
    }
}

fn review_from_node(node: RatingNode) -> Review {
    let would_take_again = match node.would_take_again {
        Some(serde_json::Value::Bool(b)) => Some(b),
        Some(serde_json::Value::Number(n)) => n.as_f64().map(|v| v != 0.0),
        _ => None,
    };
    Review {
        comment: node.comment.unwrap_or_default(),
        class_name: node.class_name.unwrap_or_default(),
        date: node.date.unwrap_or_default(),
        quality: node.helpful_rating,
        difficulty: node.difficulty_rating,
        grade: node.grade.unwrap_or_default(),
        would_take_again,
        tags: node.rating_tags.unwrap_or_default(),
        thumbs_up: node.thumbs_up_total.unwrap_or_default(),
        thumbs_down: node.thumbs_down_total.unwrap_or_default(),
    }
}

// --- GraphQL client -------------------------------------------------------

/// Production [`ProfessorSource`] speaking the paginated GraphQL protocol.
#[derive(Debug)]
pub struct GraphqlSource {
    client: reqwest::Client,
    endpoint: String,
    school_node_id: String,
    backoff: BackoffPolicy,
}

impl GraphqlSource {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&config.auth_token).context("auth token header")?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("{}/", config.referer)).context("referer header")?,
        );
        headers.insert(
            ORIGIN,
            HeaderValue::from_str(&config.referer).context("origin header")?,
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building ratings source client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            school_node_id: BASE64.encode(format!("School-{}", config.school_id)),
            backoff: config.backoff,
        })
    }

    fn teacher_node_id(source_id: i64) -> String {
        BASE64.encode(format!("Teacher-{source_id}"))
    }

    /// POST one GraphQL document, retrying transport failures and
    /// retryable statuses on the linear schedule. Decode failures are
    /// never retried; a malformed payload will not fix itself.
    async fn post_with_retry(
        &self,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, HarvestError> {
        let attempts = self.backoff.max_attempts.max(1);
        let mut last_error: Option<HarvestError> = None;

        for attempt in 0..attempts {
            match self.client.post(&self.endpoint).json(body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json().await?);
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(HarvestError::HttpStatus {
                            status: status.as_u16(),
                        });
                    }
                    last_error = Some(HarvestError::HttpStatus {
                        status: status.as_u16(),
                    });
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::NonRetryable {
                        return Err(HarvestError::Request(err));
                    }
                    last_error = Some(HarvestError::Request(err));
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.backoff.delay_after_attempt(attempt)).await;
            }
        }

        Err(last_error.expect("retry loop records an error before exhausting"))
    }

    fn extract_data(payload: serde_json::Value) -> Result<serde_json::Value, HarvestError> {
        // GraphQL wraps everything in "data"; a response without it is a
        // malformed payload, not an empty result.
        payload
            .get("data")
            .cloned()
            .ok_or_else(|| serde_json::Error::io(std::io::Error::other("missing data field")).into())
    }
}

#[async_trait]
impl ProfessorSource for GraphqlSource {
    async fn search_page(
        &self,
        query_text: &str,
        cursor: Option<&str>,
    ) -> Result<SearchPage, HarvestError> {
        let body = serde_json::json!({
            "query": SEARCH_QUERY,
            "variables": {
                "count": PAGE_SIZE,
                "cursor": cursor.unwrap_or(""),
                "query": {
                    "text": query_text,
                    "schoolID": self.school_node_id,
                },
            },
        });

        let span = info_span!("search_page", query_text, cursor = cursor.unwrap_or(""));
        let payload = self.post_with_retry(&body).instrument(span).await?;
        let data: SearchData = serde_json::from_value(Self::extract_data(payload)?)?;

        let teachers = data.search.teachers;
        Ok(SearchPage {
            records: teachers
                .edges
                .into_iter()
                .map(|edge| record_from_node(edge.node))
                .collect(),
            has_next_page: teachers.page_info.has_next_page,
            end_cursor: teachers.page_info.end_cursor,
        })
    }

    async fn recent_reviews(
        &self,
        source_id: i64,
        limit: u32,
    ) -> Result<Vec<Review>, HarvestError> {
        let body = serde_json::json!({
            "query": RATINGS_QUERY,
            "variables": {
                "id": Self::teacher_node_id(source_id),
                "count": limit,
                "cursor": "",
            },
        });

        // Single shot: only the first page is consumed and there is no
        // retry budget for this path.
        let resp = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HarvestError::HttpStatus {
                status: status.as_u16(),
            });
        }
        let payload: serde_json::Value = resp.json().await?;
        let data: RatingsData = serde_json::from_value(Self::extract_data(payload)?)?;

        let Some(ratings) = data.node.and_then(|n| n.ratings) else {
            return Ok(Vec::new());
        };
        Ok(ratings
            .edges
            .into_iter()
            .map(|edge| review_from_node(edge.node))
            .collect())
    }
}

// --- Pipeline -------------------------------------------------------------

/// Running totals reported as partitions complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestProgress {
    pub records_so_far: usize,
    pub partitions_done: usize,
    pub partitions_total: usize,
}

pub type ProgressFn = dyn Fn(HarvestProgress) + Send + Sync;

/// Fans the a-z search partitions out over a bounded permit pool and
/// collects results in completion order, deduplicating by source id.
pub struct HarvestPipeline<S> {
    source: Arc<S>,
    concurrency: usize,
    page_delay: Duration,
}

impl<S: ProfessorSource + 'static> HarvestPipeline<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            concurrency: DEFAULT_CONCURRENCY,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    /// Run one full harvest. Any partition exhausting its retries fails
    /// the whole run; a partial alphabet is never persisted.
    ///
    /// Duplicate source ids across partitions keep the first occurrence
    /// observed. Completion order is nondeterministic, so which occurrence
    /// is first is too; the source's identity constraint makes duplicates
    /// field-identical in practice.
    pub async fn run(
        &self,
        on_progress: Option<&ProgressFn>,
    ) -> Result<Vec<ProfessorRecord>, HarvestError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();

        for letter in 'a'..='z' {
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&semaphore);
            let page_delay = self.page_delay;
            workers.spawn(async move {
                fetch_partition(source, semaphore, letter, page_delay).await
            });
        }

        let partitions_total = workers.len();
        let mut partitions_done = 0usize;
        let mut seen: HashSet<i64> = HashSet::new();
        let mut records: Vec<ProfessorRecord> = Vec::new();

        while let Some(joined) = workers.join_next().await {
            let partition = joined??;
            partitions_done += 1;
            for record in partition {
                if seen.insert(record.source_id) {
                    records.push(record);
                }
            }
            debug!(
                partitions_done,
                partitions_total,
                records = records.len(),
                "harvest partition complete"
            );
            if let Some(report) = on_progress {
                report(HarvestProgress {
                    records_so_far: records.len(),
                    partitions_done,
                    partitions_total,
                });
            }
        }

        Ok(records)
    }
}

/// Walk one partition's cursor chain. The permit is held only while a
/// request is in flight, so a sleeping partition does not starve others.
async fn fetch_partition<S: ProfessorSource>(
    source: Arc<S>,
    semaphore: Arc<Semaphore>,
    letter: char,
    page_delay: Duration,
) -> Result<Vec<ProfessorRecord>, HarvestError> {
    let query = letter.to_string();
    let mut cursor: Option<String> = None;
    let mut collected = Vec::new();

    loop {
        let page = {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            source.search_page(&query, cursor.as_deref()).await?
        };
        collected.extend(page.records);

        if !page.has_next_page {
            return Ok(collected);
        }
        cursor = page.end_cursor;
        tokio::time::sleep(page_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn record(source_id: i64, last_name: &str) -> ProfessorRecord {
        ProfessorRecord {
            source_id,
            first_name: "Test".to_string(),
            last_name: last_name.to_string(),
            department: "Biology".to_string(),
            raw_department: "Biology".to_string(),
            avg_rating: Some(4.0),
            avg_difficulty: Some(2.0),
            would_take_again_pct: Some(80.0),
            num_ratings: 10,
            tags: vec![],
            courses: vec![],
        }
    }

    /// Scripted source: pages keyed by (query letter, cursor).
    struct ScriptedSource {
        pages: HashMap<(char, Option<String>), SearchPage>,
        fail_letters: Vec<char>,
        calls: Mutex<Vec<(char, Option<String>)>>,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                fail_letters: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn page(
            mut self,
            letter: char,
            cursor: Option<&str>,
            records: Vec<ProfessorRecord>,
            next: Option<&str>,
        ) -> Self {
            self.pages.insert(
                (letter, cursor.map(str::to_string)),
                SearchPage {
                    records,
                    has_next_page: next.is_some(),
                    end_cursor: next.map(str::to_string),
                },
            );
            self
        }

        fn failing(mut self, letter: char) -> Self {
            self.fail_letters.push(letter);
            self
        }
    }

    #[async_trait]
    impl ProfessorSource for ScriptedSource {
        async fn search_page(
            &self,
            query_text: &str,
            cursor: Option<&str>,
        ) -> Result<SearchPage, HarvestError> {
            let letter = query_text.chars().next().unwrap();
            self.calls
                .lock()
                .unwrap()
                .push((letter, cursor.map(str::to_string)));
            if self.fail_letters.contains(&letter) {
                return Err(HarvestError::HttpStatus { status: 500 });
            }
            Ok(self
                .pages
                .get(&(letter, cursor.map(str::to_string)))
                .cloned()
                .unwrap_or(SearchPage {
                    records: vec![],
                    has_next_page: false,
                    end_cursor: None,
                }))
        }

        async fn recent_reviews(
            &self,
            _source_id: i64,
            _limit: u32,
        ) -> Result<Vec<Review>, HarvestError> {
            Ok(Vec::new())
        }
    }

    fn pipeline(source: ScriptedSource) -> HarvestPipeline<ScriptedSource> {
        HarvestPipeline::new(Arc::new(source)).with_page_delay(Duration::from_millis(0))
    }

    #[test]
    fn backoff_schedule_is_linear() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_after_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(3));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn partition_pages_follow_cursors_in_order() {
        let source = Arc::new(
            ScriptedSource::new()
                .page('a', None, vec![record(1, "One")], Some("c1"))
                .page('a', Some("c1"), vec![record(2, "Two")], Some("c2"))
                .page('a', Some("c2"), vec![record(3, "Three")], None),
        );

        let records = HarvestPipeline::new(Arc::clone(&source))
            .with_page_delay(Duration::from_millis(0))
            .run(None)
            .await
            .unwrap();
        assert_eq!(records.len(), 3);

        let calls = source.calls.lock().unwrap();
        let cursors: Vec<Option<String>> = calls
            .iter()
            .filter(|(letter, _)| *letter == 'a')
            .map(|(_, cursor)| cursor.clone())
            .collect();
        assert_eq!(
            cursors,
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
    }

    #[tokio::test]
    async fn duplicate_ids_keep_first_occurrence_within_partition() {
        let source = ScriptedSource::new()
            .page('a', None, vec![record(7, "First")], Some("c1"))
            .page('a', Some("c1"), vec![record(7, "Second")], None);

        let records = pipeline(source).run(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].last_name, "First");
    }

    #[tokio::test]
    async fn duplicate_ids_across_partitions_collapse_to_one() {
        let source = ScriptedSource::new()
            .page('a', None, vec![record(7, "FromA")], None)
            .page('b', None, vec![record(7, "FromB"), record(8, "Only")], None);

        let records = pipeline(source).run(None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.iter().filter(|r| r.source_id == 7).count(), 1);
    }

    #[tokio::test]
    async fn progress_reports_every_partition() {
        let source = ScriptedSource::new().page('a', None, vec![record(1, "One")], None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let report = move |p: HarvestProgress| seen_clone.lock().unwrap().push(p);

        pipeline(source).run(Some(&report)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 26);
        assert!(seen.iter().all(|p| p.partitions_total == 26));
        let last = seen.last().unwrap();
        assert_eq!(last.partitions_done, 26);
        assert_eq!(last.records_so_far, 1);
    }

    #[tokio::test]
    async fn failing_partition_aborts_the_run() {
        let source = ScriptedSource::new()
            .page('a', None, vec![record(1, "One")], None)
            .failing('q');

        let err = pipeline(source).run(None).await.unwrap_err();
        assert!(matches!(err, HarvestError::HttpStatus { status: 500 }));
    }

    #[test]
    fn record_parsing_sorts_and_caps_tags_and_courses() {
        let node = TeacherNode {
            legacy_id: 42,
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            department: Some("Computer Science".to_string()),
            avg_rating: Some(4.5),
            avg_difficulty: Some(3.0),
            would_take_again_percent: Some(88.0),
            num_ratings: 120,
            teacher_rating_tags: Some(
                (0..8)
                    .map(|i| RawTag {
                        tag_name: format!("tag{i}"),
                        tag_count: i,
                    })
                    .collect(),
            ),
            course_codes: Some(
                (0..12)
                    .map(|i| RawCourse {
                        course_name: format!("CS{i}0{i}"),
                        course_count: i,
                    })
                    .collect(),
            ),
        };

        let rec = record_from_node(node);
        // tag0 had count 0 and is dropped; the rest sort descending.
        assert_eq!(rec.tags.len(), 5);
        assert_eq!(rec.tags[0].name, "tag7");
        assert_eq!(rec.courses.len(), 10);
        assert!(rec.courses.windows(2).all(|w| w[0].count >= w[1].count));
        // CS-heavy course load resolves the broad label to itself here.
        assert_eq!(rec.department, "Computer Science");
        assert_eq!(rec.raw_department, "Computer Science");
    }

    #[test]
    fn record_parsing_defaults_missing_department_to_unknown() {
        let node = TeacherNode {
            legacy_id: 1,
            first_name: "No".to_string(),
            last_name: "Dept".to_string(),
            department: None,
            avg_rating: None,
            avg_difficulty: None,
            would_take_again_percent: None,
            num_ratings: 0,
            teacher_rating_tags: None,
            course_codes: None,
        };
        let rec = record_from_node(node);
        assert_eq!(rec.department, UNKNOWN_DEPARTMENT);
        assert_eq!(rec.raw_department, UNKNOWN_DEPARTMENT);
    }

    #[test]
    fn record_parsing_reclassifies_broad_departments() {
        let node = TeacherNode {
            legacy_id: 2,
            first_name: "Grace".to_string(),
            last_name: "Hopper".to_string(),
            department: Some("Engineering".to_string()),
            avg_rating: Some(4.0),
            avg_difficulty: Some(2.0),
            would_take_again_percent: Some(90.0),
            num_ratings: 30,
            teacher_rating_tags: None,
            course_codes: Some(vec![
                RawCourse {
                    course_name: "EE330".to_string(),
                    course_count: 12,
                },
                RawCourse {
                    course_name: "MATH120".to_string(),
                    course_count: 3,
                },
            ]),
        };
        let rec = record_from_node(node);
        assert_eq!(rec.department, "Electrical Engineering");
        assert_eq!(rec.raw_department, "Engineering");
    }

    #[test]
    fn review_parsing_normalizes_would_take_again() {
        let node = RatingNode {
            comment: Some("great".to_string()),
            class_name: Some("CS101".to_string()),
            date: Some("2025-11-02".to_string()),
            helpful_rating: Some(5.0),
            difficulty_rating: Some(2.0),
            grade: Some("A".to_string()),
            would_take_again: Some(serde_json::Value::Number(1.into())),
            rating_tags: Some("Caring--Inspirational".to_string()),
            thumbs_up_total: Some(3),
            thumbs_down_total: None,
        };
        let review = review_from_node(node);
        assert_eq!(review.would_take_again, Some(true));
        assert_eq!(review.thumbs_down, 0);

        let absent = review_from_node(RatingNode {
            comment: None,
            class_name: None,
            date: None,
            helpful_rating: None,
            difficulty_rating: None,
            grade: None,
            would_take_again: Some(serde_json::Value::Null),
            rating_tags: None,
            thumbs_up_total: None,
            thumbs_down_total: None,
        });
        assert_eq!(absent.would_take_again, None);
        assert_eq!(absent.comment, "");
    }

    #[test]
    fn search_payload_decodes_from_wire_shape() {
        let payload = serde_json::json!({
            "search": {
                "teachers": {
                    "edges": [{
                        "cursor": "abc",
                        "node": {
                            "id": "VGVhY2hlci0x",
                            "legacyId": 12345,
                            "firstName": "Alan",
                            "lastName": "Turing",
                            "department": "Computer Science",
                            "avgRating": 4.9,
                            "avgDifficulty": 4.0,
                            "wouldTakeAgainPercent": 95.0,
                            "numRatings": 87,
                            "teacherRatingTags": [
                                {"tagName": "Brilliant", "tagCount": 12}
                            ],
                            "courseCodes": [
                                {"courseName": "CS570", "courseCount": 20}
                            ]
                        }
                    }],
                    "pageInfo": {"hasNextPage": true, "endCursor": "abc"},
                    "resultCount": 1
                }
            }
        });
        let data: SearchData = serde_json::from_value(payload).unwrap();
        assert_eq!(data.search.teachers.edges.len(), 1);
        assert!(data.search.teachers.page_info.has_next_page);
        let rec = record_from_node(
            data.search
                .teachers
                .edges
                .into_iter()
                .next()
                .unwrap()
                .node,
        );
        assert_eq!(rec.source_id, 12345);
        assert_eq!(rec.tags[0].name, "Brilliant");
    }

    #[test]
    fn truncated_search_payload_is_a_decode_error() {
        let payload = serde_json::json!({
            "search": {
                "teachers": {
                    "edges": [{"node": {"legacyId": 1}}],
                    "pageInfo": {"hasNextPage": false, "endCursor": null}
                }
            }
        });
        let result: Result<SearchData, _> = serde_json::from_value(payload);
        assert!(result.is_err());
    }
}
