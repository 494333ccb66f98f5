//! Core domain model and rating/department logic for profrank.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "profrank-core";

/// One rating tag with how many reviewers applied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub name: String,
    pub count: i64,
}

/// One course code with how many reviews mention it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseEntry {
    pub name: String,
    pub count: i64,
}

/// Canonical professor representation produced by a harvest run.
///
/// `department` is the resolved value used for grouping and filtering;
/// `raw_department` is kept exactly as the source reported it.
/// A negative `would_take_again_pct` is the source's "unknown" sentinel and
/// must never be treated as a real percentage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfessorRecord {
    pub source_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub department: String,
    pub raw_department: String,
    pub avg_rating: Option<f64>,
    pub avg_difficulty: Option<f64>,
    pub would_take_again_pct: Option<f64>,
    pub num_ratings: i64,
    pub tags: Vec<TagCount>,
    pub courses: Vec<CourseEntry>,
}

/// One student review, normalized from the upstream ratings feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub comment: String,
    pub class_name: String,
    pub date: String,
    pub quality: Option<f64>,
    pub difficulty: Option<f64>,
    pub grade: String,
    pub would_take_again: Option<bool>,
    pub tags: String,
    pub thumbs_up: i64,
    pub thumbs_down: i64,
}

/// Singleton harvest bookkeeping, overwritten wholesale on every
/// successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeMeta {
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub total_professors: i64,
}

/// Department label used when the source reports none. Never grouped,
/// never listed.
pub const UNKNOWN_DEPARTMENT: &str = "Unknown";

// --- Weighted score -------------------------------------------------------

pub const WEIGHT_RATING: f64 = 0.40;
pub const WEIGHT_WOULD_TAKE_AGAIN: f64 = 0.35;
pub const WEIGHT_DIFFICULTY: f64 = 0.25;

/// Composite 0-1 quality score from the three noisy rating inputs,
/// rounded to 3 decimals.
///
/// A missing or non-positive rating yields exactly 0.0: a professor with no
/// usable rating gets no partial credit from the other inputs. A negative
/// would-take-again percentage (the source's "unknown" sentinel) counts as
/// 0 here; a missing difficulty defaults to the 2.5 midpoint.
pub fn weighted_score(
    avg_rating: Option<f64>,
    would_take_again_pct: Option<f64>,
    avg_difficulty: Option<f64>,
) -> f64 {
    let rating = match avg_rating {
        Some(r) if r > 0.0 => r,
        _ => return 0.0,
    };
    let wta = would_take_again_pct.filter(|p| *p >= 0.0).unwrap_or(0.0);
    let difficulty = avg_difficulty.unwrap_or(2.5);

    let score = (rating / 5.0) * WEIGHT_RATING
        + (wta / 100.0) * WEIGHT_WOULD_TAKE_AGAIN
        + ((5.0 - difficulty) / 5.0) * WEIGHT_DIFFICULTY;
    round3(score)
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

// --- Subdepartment resolution --------------------------------------------

/// Course prefixes mapped to narrower department names. Used to reclassify
/// professors filed under the source's broad catch-all departments.
const COURSE_PREFIX_SUBDEPARTMENTS: &[(&str, &str)] = &[
    ("COMPE", "Computer Engineering"),
    ("COMP", "Computer Engineering"),
    ("EE", "Electrical Engineering"),
    ("ECE", "Electrical & Computer Engineering"),
    ("ME", "Mechanical Engineering"),
    ("AE", "Aerospace Engineering"),
    ("AERO", "Aerospace Engineering"),
    ("CE", "Civil Engineering"),
    ("CIVIL", "Civil Engineering"),
    ("SE", "Software Engineering"),
    ("ENVE", "Environmental Engineering"),
    ("ENV", "Environmental Engineering"),
    ("CHE", "Chemical Engineering"),
    ("BENG", "Bioengineering"),
    ("BIO_E", "Bioengineering"),
    ("ENGR", "Engineering"),
    ("ENGIN", "Engineering"),
    ("CS", "Computer Science"),
    ("CSC", "Computer Science"),
    ("PHYS", "Physics"),
    ("MATH", "Mathematics"),
    ("STAT", "Statistics"),
];

/// Only professors filed under these labels are eligible for
/// reclassification; everything else passes through unchanged.
pub const BROAD_DEPARTMENTS: &[&str] = &["Engineering", "Computer Science", "Science"];

fn subdepartment_for_prefix(prefix: &str) -> Option<&'static str> {
    COURSE_PREFIX_SUBDEPARTMENTS
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, dept)| *dept)
}

/// Leading alphabetic prefix of a course code (letters and underscores,
/// uppercased). Prefixes shorter than 2 characters are discarded as noise.
fn course_prefix(course_name: &str) -> Option<String> {
    let prefix: String = course_name
        .chars()
        .take_while(|c| c.is_ascii_alphabetic() || *c == '_')
        .collect();
    if prefix.len() >= 2 {
        Some(prefix.to_ascii_uppercase())
    } else {
        None
    }
}

/// Best-effort reclassification of a broad department by weighted
/// course-prefix vote.
///
/// Weights are accumulated per prefix in first-seen order, and the winner
/// must be strictly heavier than the running best, so an equal-weight
/// latecomer never displaces an earlier prefix. Returns the original label
/// when it is not broad, when there is no course data, or when no prefix
/// maps to a known subdepartment.
pub fn resolve_subdepartment(department: &str, courses: &[CourseEntry]) -> String {
    if !BROAD_DEPARTMENTS.contains(&department) {
        return department.to_string();
    }

    let mut prefix_weights: Vec<(String, i64)> = Vec::new();
    for course in courses {
        let Some(prefix) = course_prefix(&course.name) else {
            continue;
        };
        match prefix_weights.iter_mut().find(|(p, _)| *p == prefix) {
            Some((_, weight)) => *weight += course.count,
            None => prefix_weights.push((prefix, course.count)),
        }
    }

    let mut best: Option<&'static str> = None;
    let mut best_weight = 0i64;
    for (prefix, weight) in &prefix_weights {
        if let Some(subdept) = subdepartment_for_prefix(prefix) {
            if *weight > best_weight {
                best = Some(subdept);
                best_weight = *weight;
            }
        }
    }

    best.map(str::to_string)
        .unwrap_or_else(|| department.to_string())
}

// --- Department canonicalization -----------------------------------------

/// A set of raw department spellings sharing one normalized key, with the
/// display name chosen to represent them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentGroup {
    pub key: String,
    pub variants: Vec<String>,
    pub display: String,
}

/// Merges duplicate department spellings and picks display names,
/// preferring an official reference list when one is configured.
///
/// Grouping is always recomputed from the raw values handed in; nothing is
/// cached here, since the underlying set changes on every harvest.
#[derive(Debug, Clone, Default)]
pub struct Canonicalizer {
    /// (normalized key, official display name) in reference-list order.
    official: Vec<(String, String)>,
}

impl Canonicalizer {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(official_names: impl IntoIterator<Item = String>) -> Self {
        let mut official = Vec::new();
        for name in official_names {
            let key = Self::normalize_key(&name);
            if !key.is_empty() {
                official.push((key, name));
            }
        }
        Self { official }
    }

    /// Load the official reference list: one name per line, `#` comments
    /// and blank lines ignored. A missing or unreadable file degrades to an
    /// empty list and heuristic tie-breaking only.
    pub fn from_reference_file(path: impl AsRef<Path>) -> Self {
        let Ok(text) = std::fs::read_to_string(path.as_ref()) else {
            return Self::empty();
        };
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        )
    }

    pub fn has_reference_names(&self) -> bool {
        !self.official.is_empty()
    }

    /// Grouping key for duplicate department spellings: case-insensitive,
    /// whitespace-collapsed, with "and"/"amp" conjunctions unified to "&".
    /// Empty strings and the Unknown sentinel pass through unchanged.
    pub fn normalize_key(name: &str) -> String {
        if name.is_empty() || name == UNKNOWN_DEPARTMENT {
            return name.to_string();
        }
        let collapsed = name
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        collapsed
            .replace(" amp ", " & ")
            .replace(" and ", " & ")
    }

    /// Pick one display name for a group of raw spellings.
    ///
    /// An official reference name wins when any variant's key matches one
    /// (reference-list order decides; at most one key can match anyway).
    /// Otherwise prefer the variant spelling its conjunction with "&", then
    /// the longest, then the lexicographically greatest for determinism.
    pub fn pick_display(&self, variants: &[String]) -> String {
        if variants.is_empty() {
            return UNKNOWN_DEPARTMENT.to_string();
        }
        for (key, display) in &self.official {
            if variants.iter().any(|v| Self::normalize_key(v) == *key) {
                return display.clone();
            }
        }
        variants
            .iter()
            .max_by_key(|v| (v.contains(" & "), v.len(), v.as_str()))
            .expect("variants checked non-empty")
            .clone()
    }

    /// Partition raw department values into canonical groups, dropping the
    /// Unknown sentinel and empty values. Group and variant order are
    /// deterministic regardless of input order.
    pub fn group<I, S>(&self, raw_names: I) -> Vec<DepartmentGroup>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut by_key: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for raw in raw_names {
            let raw = raw.into();
            if raw.is_empty() || raw == UNKNOWN_DEPARTMENT {
                continue;
            }
            let key = Self::normalize_key(&raw);
            let variants = by_key.entry(key).or_default();
            if !variants.contains(&raw) {
                variants.push(raw);
            }
        }

        by_key
            .into_iter()
            .map(|(key, mut variants)| {
                variants.sort();
                let display = self.pick_display(&variants);
                DepartmentGroup {
                    key,
                    variants,
                    display,
                }
            })
            .collect()
    }

    /// Map each raw spelling to its group's display name.
    pub fn display_map<I, S>(&self, raw_names: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = BTreeMap::new();
        for group in self.group(raw_names) {
            for variant in &group.variants {
                map.insert(variant.clone(), group.display.clone());
            }
        }
        map
    }

    /// All raw spellings among `raw_names` sharing a key with `name`.
    /// Accepts either a canonical display name or any raw variant.
    pub fn matching_raw<'a>(&self, name: &str, raw_names: &'a [String]) -> Vec<&'a String> {
        let key = Self::normalize_key(name);
        raw_names
            .iter()
            .filter(|raw| Self::normalize_key(raw) == key)
            .collect()
    }
}
