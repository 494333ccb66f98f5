//! SQLite repository for harvested professor records and ranked views.
//!
//! The store owns all persisted state. Department canonicalization and
//! weighted scoring are applied at read time, so every query sees the
//! groups implied by the rows currently on disk.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use profrank_core::{
    round3, Canonicalizer, CourseEntry, ProfessorRecord, ScrapeMeta, TagCount,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "profrank-storage";

/// Harvested data older than this is considered stale.
pub const CACHE_MAX_AGE_DAYS: i64 = 7;

/// Inline weighted-score formula shared by the ranked queries. Rows with
/// no ratings, a non-positive rating, or the negative would-take-again
/// sentinel score exactly 0; only rows passing all three gates get the
/// full formula.
const WEIGHTED_SCORE_SQL: &str = "CASE WHEN num_ratings > 0 AND avg_rating > 0 AND would_take_again_pct >= 0 \
     THEN (avg_rating / 5.0) * 0.4 \
          + (would_take_again_pct / 100.0) * 0.35 \
          + ((5.0 - avg_difficulty) / 5.0) * 0.25 \
     ELSE 0.0 END";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt {column} column: {source}")]
    Corrupt {
        column: &'static str,
        source: serde_json::Error,
    },
}

/// Sort orders accepted by the professor listing. Anything else silently
/// falls back to rating-descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    AvgRating,
    AvgDifficulty,
    WouldTakeAgainPct,
    NumRatings,
    WeightedScore,
    Name,
}

impl SortKey {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "avg_rating" => Self::AvgRating,
            "avg_difficulty" => Self::AvgDifficulty,
            "would_take_again_pct" => Self::WouldTakeAgainPct,
            "num_ratings" => Self::NumRatings,
            "weighted_score" => Self::WeightedScore,
            "name" => Self::Name,
            _ => Self::AvgRating,
        }
    }

    fn order_clause(self) -> &'static str {
        match self {
            Self::AvgRating => "avg_rating DESC",
            Self::AvgDifficulty => "avg_difficulty DESC",
            Self::WouldTakeAgainPct => "would_take_again_pct DESC",
            Self::NumRatings => "num_ratings DESC",
            Self::WeightedScore => "weighted_score DESC",
            Self::Name => "last_name ASC, first_name ASC",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProfessorFilter {
    /// Canonical display name or any raw spelling; resolved to every raw
    /// variant sharing its key.
    pub department: Option<String>,
    pub sort: SortKey,
    pub min_ratings: i64,
}

/// One professor row as served to clients: canonical department, weighted
/// score, and its 1-based position in the returned order.
#[derive(Debug, Clone, Serialize)]
pub struct RankedProfessor {
    pub rank: usize,
    pub source_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub department: String,
    pub avg_rating: Option<f64>,
    pub avg_difficulty: Option<f64>,
    pub would_take_again_pct: Option<f64>,
    pub num_ratings: i64,
    pub tags: Vec<TagCount>,
    pub courses: Vec<CourseEntry>,
    pub weighted_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopProfessor {
    pub rank: usize,
    pub source_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub avg_rating: Option<f64>,
    pub avg_difficulty: Option<f64>,
    pub would_take_again_pct: Option<f64>,
    pub num_ratings: i64,
    pub weighted_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepartmentStats {
    pub name: String,
    pub professor_count: i64,
    pub avg_rating: f64,
    pub avg_difficulty: f64,
    /// Mean would-take-again with the negative sentinel excluded from the
    /// average; None when no professor in the group has a known value.
    pub avg_would_take_again: Option<f64>,
    pub total_reviews: i64,
    pub top_professors: Vec<TopProfessor>,
    pub top_tags: Vec<TagCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HardestDepartment {
    pub name: String,
    pub avg_difficulty: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HardestProfessor {
    pub name: String,
    pub department: String,
    pub avg_difficulty: Option<f64>,
    pub num_ratings: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub total_professors: i64,
    pub rated_professors: i64,
    pub avg_quality: Option<f64>,
    pub hardest_department: Option<HardestDepartment>,
    pub hardest_professor: Option<HardestProfessor>,
    pub last_scraped: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (creating if missing) the database at `url` and ensure the
    /// schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Single-connection in-memory store, used by tests and ad-hoc runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS professors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER UNIQUE NOT NULL,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                department TEXT NOT NULL,
                raw_department TEXT,
                avg_rating REAL,
                avg_difficulty REAL,
                would_take_again_pct REAL,
                num_ratings INTEGER DEFAULT 0,
                tags TEXT DEFAULT '[]',
                courses TEXT DEFAULT '[]',
                scraped_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_department ON professors(department)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_avg_rating ON professors(avg_rating DESC)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_num_ratings ON professors(num_ratings DESC)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scrape_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_scraped_at TIMESTAMP,
                total_professors INTEGER DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replace the whole dataset in one transaction and stamp the harvest
    /// metadata. Nothing is written unless the full batch lands.
    pub async fn replace_all(
        &self,
        records: &[ProfessorRecord],
        scraped_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM professors").execute(&mut *tx).await?;

        for record in records {
            let tags = serde_json::to_string(&record.tags)
                .map_err(|source| StoreError::Corrupt { column: "tags", source })?;
            let courses = serde_json::to_string(&record.courses)
                .map_err(|source| StoreError::Corrupt { column: "courses", source })?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO professors
                    (source_id, first_name, last_name, department, raw_department,
                     avg_rating, avg_difficulty, would_take_again_pct, num_ratings,
                     tags, courses, scraped_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.source_id)
            .bind(&record.first_name)
            .bind(&record.last_name)
            .bind(&record.department)
            .bind(&record.raw_department)
            .bind(record.avg_rating)
            .bind(record.avg_difficulty)
            .bind(record.would_take_again_pct)
            .bind(record.num_ratings)
            .bind(tags)
            .bind(courses)
            .bind(scraped_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO scrape_meta (id, last_scraped_at, total_professors)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET last_scraped_at = ?, total_professors = ?
            "#,
        )
        .bind(scraped_at)
        .bind(records.len() as i64)
        .bind(scraped_at)
        .bind(records.len() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(records = records.len(), "replaced professor dataset");
        Ok(())
    }

    pub async fn meta(&self) -> Result<Option<ScrapeMeta>, StoreError> {
        let row = sqlx::query("SELECT last_scraped_at, total_professors FROM scrape_meta WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(ScrapeMeta {
                last_scraped_at: r.try_get("last_scraped_at")?,
                total_professors: r.try_get("total_professors")?,
            })
        })
        .transpose()
    }

    /// Absent metadata means never harvested, which is never fresh.
    pub async fn is_fresh(&self) -> Result<bool, StoreError> {
        let Some(meta) = self.meta().await? else {
            return Ok(false);
        };
        let Some(last_scraped_at) = meta.last_scraped_at else {
            return Ok(false);
        };
        Ok(Utc::now() - last_scraped_at < Duration::days(CACHE_MAX_AGE_DAYS))
    }

    async fn distinct_departments(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT department FROM professors WHERE department != 'Unknown'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("department").map_err(StoreError::from))
            .collect()
    }

    /// Ranked professor listing. A department filter is resolved back to
    /// every raw spelling sharing its normalized key, so filtering by any
    /// variant returns the full merged group.
    pub async fn list_professors(
        &self,
        canon: &Canonicalizer,
        filter: &ProfessorFilter,
    ) -> Result<Vec<RankedProfessor>, StoreError> {
        let raw_departments = self.distinct_departments().await?;
        let display = canon.display_map(raw_departments.iter().cloned());

        let mut sql = format!(
            "SELECT *, {WEIGHTED_SCORE_SQL} AS weighted_score FROM professors WHERE num_ratings >= ?"
        );
        let mut department_params: Vec<String> = Vec::new();

        if let Some(department) = &filter.department {
            let matching: Vec<String> = canon
                .matching_raw(department, &raw_departments)
                .into_iter()
                .cloned()
                .collect();
            if matching.is_empty() {
                sql.push_str(" AND department = ?");
                department_params.push(department.clone());
            } else {
                let placeholders = vec!["?"; matching.len()].join(",");
                sql.push_str(&format!(" AND department IN ({placeholders})"));
                department_params = matching;
            }
        }

        sql.push_str(" ORDER BY ");
        sql.push_str(filter.sort.order_clause());

        let mut query = sqlx::query(&sql).bind(filter.min_ratings);
        for param in &department_params {
            query = query.bind(param);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            out.push(ranked_from_row(row, idx + 1, &display)?);
        }
        Ok(out)
    }

    /// Professors grouped by course code. Matching is case-insensitive and
    /// whitespace-stripped on both sides, so "cs 101", "CS101" and
    /// "CS 101" all hit the same stored entry.
    pub async fn professors_by_courses(
        &self,
        canon: &Canonicalizer,
        course_codes: &[String],
    ) -> Result<BTreeMap<String, Vec<RankedProfessor>>, StoreError> {
        let normalized: Vec<String> = course_codes
            .iter()
            .map(|c| normalize_course_code(c))
            .filter(|c| !c.is_empty())
            .collect();
        if normalized.is_empty() {
            return Ok(BTreeMap::new());
        }

        let raw_departments = self.distinct_departments().await?;
        let display = canon.display_map(raw_departments.iter().cloned());

        let sql = format!(
            "SELECT *, {WEIGHTED_SCORE_SQL} AS weighted_score FROM professors \
             WHERE num_ratings >= 1 ORDER BY weighted_score DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            candidates.push(ranked_from_row(row, 0, &display)?);
        }

        let mut results = BTreeMap::new();
        for code in normalized {
            let mut matches: Vec<RankedProfessor> = candidates
                .iter()
                .filter(|p| {
                    p.courses
                        .iter()
                        .any(|course| normalize_course_code(&course.name) == code)
                })
                .cloned()
                .collect();
            for (idx, professor) in matches.iter_mut().enumerate() {
                professor.rank = idx + 1;
            }
            results.insert(code, matches);
        }
        Ok(results)
    }

    /// Distinct canonical department names, alphabetical.
    pub async fn departments(&self, canon: &Canonicalizer) -> Result<Vec<String>, StoreError> {
        let raw = self.distinct_departments().await?;
        let mut names: Vec<String> = canon.group(raw).into_iter().map(|g| g.display).collect();
        names.sort();
        Ok(names)
    }

    /// Aggregate stats per canonical department group, sorted by mean
    /// rating descending.
    pub async fn department_stats(
        &self,
        canon: &Canonicalizer,
    ) -> Result<Vec<DepartmentStats>, StoreError> {
        let raw = self.distinct_departments().await?;
        let mut groups = canon.group(raw);
        groups.sort_by(|a, b| a.display.cmp(&b.display));

        let mut stats = Vec::with_capacity(groups.len());
        for group in &groups {
            stats.push(self.department_group_stats(&group.display, &group.variants).await?);
        }

        stats.sort_by(|a, b| {
            b.avg_rating
                .partial_cmp(&a.avg_rating)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(stats)
    }

    async fn department_group_stats(
        &self,
        display: &str,
        variants: &[String],
    ) -> Result<DepartmentStats, StoreError> {
        let placeholders = vec!["?"; variants.len()].join(",");

        let agg_sql = format!(
            "SELECT COUNT(*) AS professor_count, \
                    AVG(avg_rating) AS avg_rating, \
                    AVG(avg_difficulty) AS avg_difficulty, \
                    AVG(CASE WHEN would_take_again_pct >= 0 THEN would_take_again_pct END) AS avg_wta, \
                    SUM(num_ratings) AS total_reviews \
             FROM professors WHERE department IN ({placeholders}) AND num_ratings >= 1"
        );
        let mut agg_query = sqlx::query(&agg_sql);
        for variant in variants {
            agg_query = agg_query.bind(variant);
        }
        let agg = agg_query.fetch_one(&self.pool).await?;

        let top_sql = format!(
            "SELECT source_id, first_name, last_name, avg_rating, avg_difficulty, \
                    would_take_again_pct, num_ratings, \
                    {WEIGHTED_SCORE_SQL} AS weighted_score \
             FROM professors WHERE department IN ({placeholders}) AND num_ratings >= 3 \
             ORDER BY weighted_score DESC LIMIT 5"
        );
        let mut top_query = sqlx::query(&top_sql);
        for variant in variants {
            top_query = top_query.bind(variant);
        }
        let top_rows = top_query.fetch_all(&self.pool).await?;

        let mut top_professors = Vec::with_capacity(top_rows.len());
        for (idx, row) in top_rows.iter().enumerate() {
            top_professors.push(TopProfessor {
                rank: idx + 1,
                source_id: row.try_get("source_id")?,
                first_name: row.try_get("first_name")?,
                last_name: row.try_get("last_name")?,
                avg_rating: row.try_get("avg_rating")?,
                avg_difficulty: row.try_get("avg_difficulty")?,
                would_take_again_pct: row.try_get("would_take_again_pct")?,
                num_ratings: row.try_get("num_ratings")?,
                weighted_score: round3(
                    row.try_get::<Option<f64>, _>("weighted_score")?.unwrap_or(0.0),
                ),
            });
        }

        let tags_sql = format!(
            "SELECT tags FROM professors \
             WHERE department IN ({placeholders}) AND num_ratings >= 1 AND tags != '[]'"
        );
        let mut tags_query = sqlx::query(&tags_sql);
        for variant in variants {
            tags_query = tags_query.bind(variant);
        }
        let tag_rows = tags_query.fetch_all(&self.pool).await?;

        // Accumulate in first-seen order so equal counts sort stably.
        let mut tag_counts: Vec<TagCount> = Vec::new();
        for row in &tag_rows {
            let raw: String = row.try_get("tags")?;
            let tags: Vec<TagCount> = serde_json::from_str(&raw)
                .map_err(|source| StoreError::Corrupt { column: "tags", source })?;
            for tag in tags {
                match tag_counts.iter_mut().find(|t| t.name == tag.name) {
                    Some(existing) => existing.count += tag.count,
                    None => tag_counts.push(tag),
                }
            }
        }
        tag_counts.sort_by(|a, b| b.count.cmp(&a.count));
        tag_counts.truncate(5);

        Ok(DepartmentStats {
            name: display.to_string(),
            professor_count: agg.try_get("professor_count")?,
            avg_rating: round2(agg.try_get::<Option<f64>, _>("avg_rating")?.unwrap_or(0.0)),
            avg_difficulty: round2(agg.try_get::<Option<f64>, _>("avg_difficulty")?.unwrap_or(0.0)),
            avg_would_take_again: agg.try_get::<Option<f64>, _>("avg_wta")?.map(round1),
            total_reviews: agg.try_get::<Option<i64>, _>("total_reviews")?.unwrap_or(0),
            top_professors,
            top_tags: tag_counts,
        })
    }

    pub async fn global_stats(&self, canon: &Canonicalizer) -> Result<GlobalStats, StoreError> {
        let total_professors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM professors")
            .fetch_one(&self.pool)
            .await?;
        let rated_professors: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM professors WHERE num_ratings > 0")
                .fetch_one(&self.pool)
                .await?;
        let avg_quality: Option<f64> =
            sqlx::query_scalar("SELECT AVG(avg_rating) FROM professors WHERE num_ratings >= 5")
                .fetch_one(&self.pool)
                .await?;

        let raw_departments = self.distinct_departments().await?;
        let display = canon.display_map(raw_departments.iter().cloned());

        let hardest_department = sqlx::query(
            "SELECT department, AVG(avg_difficulty) AS avg_diff, SUM(num_ratings) AS total_reviews \
             FROM professors WHERE num_ratings >= 5 AND department != 'Unknown' \
             GROUP BY department HAVING total_reviews >= 100 \
             ORDER BY avg_diff DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|row| -> Result<HardestDepartment, StoreError> {
            let department: String = row.try_get("department")?;
            Ok(HardestDepartment {
                name: display.get(&department).cloned().unwrap_or(department),
                avg_difficulty: round2(row.try_get::<Option<f64>, _>("avg_diff")?.unwrap_or(0.0)),
            })
        })
        .transpose()?;

        let hardest_professor = sqlx::query(
            "SELECT first_name, last_name, department, avg_difficulty, num_ratings \
             FROM professors WHERE num_ratings >= 50 \
             ORDER BY avg_difficulty DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|row| -> Result<HardestProfessor, StoreError> {
            let first_name: String = row.try_get("first_name")?;
            let last_name: String = row.try_get("last_name")?;
            let department: String = row.try_get("department")?;
            Ok(HardestProfessor {
                name: format!("{first_name} {last_name}"),
                department: display.get(&department).cloned().unwrap_or(department),
                avg_difficulty: row.try_get("avg_difficulty")?,
                num_ratings: row.try_get("num_ratings")?,
            })
        })
        .transpose()?;

        let last_scraped = self.meta().await?.and_then(|m| m.last_scraped_at);

        Ok(GlobalStats {
            total_professors,
            rated_professors,
            avg_quality: avg_quality.map(round2),
            hardest_department,
            hardest_professor,
            last_scraped,
        })
    }
}

fn ranked_from_row(
    row: &SqliteRow,
    rank: usize,
    display: &BTreeMap<String, String>,
) -> Result<RankedProfessor, StoreError> {
    let department: String = row.try_get("department")?;
    let tags_raw: String = row.try_get("tags")?;
    let courses_raw: String = row.try_get("courses")?;
    Ok(RankedProfessor {
        rank,
        source_id: row.try_get("source_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        department: display.get(&department).cloned().unwrap_or(department),
        avg_rating: row.try_get("avg_rating")?,
        avg_difficulty: row.try_get("avg_difficulty")?,
        would_take_again_pct: row.try_get("would_take_again_pct")?,
        num_ratings: row.try_get("num_ratings")?,
        tags: serde_json::from_str(&tags_raw)
            .map_err(|source| StoreError::Corrupt { column: "tags", source })?,
        courses: serde_json::from_str(&courses_raw)
            .map_err(|source| StoreError::Corrupt { column: "courses", source })?,
        weighted_score: round3(row.try_get::<Option<f64>, _>("weighted_score")?.unwrap_or(0.0)),
    })
}

fn normalize_course_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
