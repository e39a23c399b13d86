//! Row model, identity indexing, reconciliation and text rendering for stagecheck.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Placeholder shown when a user has no usable display name.
pub const UNKNOWN_NAME: &str = "Unknown";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One flat row as returned by the REST interface.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(JsonMap<String, JsonValue>);

impl Record {
    pub fn new(fields: JsonMap<String, JsonValue>) -> Self {
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(JsonValue::as_str)
    }

    pub fn bool_field(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(JsonValue::as_bool)
    }

    pub fn f64_field(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(JsonValue::as_f64)
    }

    /// Join-key view of a column: strings as-is, numbers and booleans
    /// stringified, null or absent values yield `None`.
    pub fn key_field(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn fields(&self) -> &JsonMap<String, JsonValue> {
        &self.0
    }
}

impl From<JsonMap<String, JsonValue>> for Record {
    fn from(fields: JsonMap<String, JsonValue>) -> Self {
        Self(fields)
    }
}

// ---------------------------------------------------------------------------
// Typed row schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStage {
    pub id: Option<String>,
    pub event_id: Option<String>,
    pub name: Option<String>,
    pub start_date: Option<String>,
    pub stage_number: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Participant {
    pub user_id: Option<String>,
    pub joined_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub id: Option<String>,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConnection {
    pub user_id: Option<String>,
    pub platform: Option<String>,
    pub is_active: Option<bool>,
}

impl DeviceConnection {
    pub fn is_active(&self) -> bool {
        self.is_active.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkoutMetric {
    pub id: Option<JsonValue>,
    pub user_id: Option<String>,
    pub title: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub start_time: Option<String>,
    pub source_platform: Option<String>,
    pub distance: Option<f64>,
    pub elapsed_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageResult {
    pub id: Option<String>,
    pub user_id: Option<String>,
    pub stage_id: Option<String>,
    pub status: Option<String>,
    pub elapsed_time_seconds: Option<f64>,
    pub strava_activity_id: Option<JsonValue>,
}

impl StageResult {
    pub fn status_label(&self) -> &str {
        self.status.as_deref().unwrap_or("pending")
    }

    /// Activity ids arrive as numbers or strings depending on the writer.
    pub fn activity_id_label(&self) -> String {
        scalar_label(self.strava_activity_id.as_ref())
    }
}

/// Row of the legacy `activities` table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityRow {
    pub user_id: Option<String>,
    pub date: Option<String>,
    pub source: Option<String>,
}

// ---------------------------------------------------------------------------
// Identity index
// ---------------------------------------------------------------------------

/// Mapping from a unique key (usually a user id) to a derived value.
///
/// Built in one pass; a repeated key overwrites the earlier value and rows
/// without a key are counted in [`IdentityIndex::skipped`].
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityIndex<V> {
    entries: HashMap<String, V>,
    skipped: usize,
}

impl<V> Default for IdentityIndex<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            skipped: 0,
        }
    }
}

impl<V> IdentityIndex<V> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build<R, K, P>(rows: impl IntoIterator<Item = R>, key: K, project: P) -> Self
    where
        K: Fn(&R) -> Option<String>,
        P: Fn(&R) -> V,
    {
        let mut entries = HashMap::new();
        let mut skipped = 0usize;
        for row in rows {
            match key(&row) {
                Some(k) => {
                    let value = project(&row);
                    entries.insert(k, value);
                }
                None => skipped += 1,
            }
        }
        Self { entries, skipped }
    }

    pub fn from_records<P>(records: &[Record], key_field: &str, project: P) -> Self
    where
        P: Fn(&Record) -> V,
    {
        Self::build(records.iter(), |r| r.key_field(key_field), |r| project(*r))
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows dropped because the key column was absent or null.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys in ascending order, for stable output.
    pub fn sorted_keys(&self) -> Vec<&str> {
        let mut keys = self.keys().collect::<Vec<_>>();
        keys.sort_unstable();
        keys
    }
}

impl<V> FromIterator<(String, V)> for IdentityIndex<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
            skipped: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "kebab-case")]
pub enum Outcome<O> {
    Matched(O),
    Missing,
    FallbackMatched(O),
    FallbackMissing,
}

impl<O> Outcome<O> {
    pub fn is_matched(&self) -> bool {
        matches!(self, Outcome::Matched(_) | Outcome::FallbackMatched(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Outcome::FallbackMatched(_) | Outcome::FallbackMissing)
    }

    pub fn detail(&self) -> Option<&O> {
        match self {
            Outcome::Matched(o) | Outcome::FallbackMatched(o) => Some(o),
            Outcome::Missing | Outcome::FallbackMissing => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Matched(_) => "matched",
            Outcome::Missing => "missing",
            Outcome::FallbackMatched(_) => "fallback-matched",
            Outcome::FallbackMissing => "fallback-missing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutcomeCounts {
    pub matched: usize,
    pub missing: usize,
}

/// Outcome for every key of the expected index, in key order.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation<O> {
    outcomes: BTreeMap<String, Outcome<O>>,
    used_fallback: bool,
}

impl<O> Reconciliation<O> {
    pub fn get(&self, key: &str) -> Option<&Outcome<O>> {
        self.outcomes.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome<O>)> {
        self.outcomes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn used_fallback(&self) -> bool {
        self.used_fallback
    }

    pub fn matched_keys(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, o)| o.is_matched())
            .map(|(k, _)| k)
            .collect()
    }

    pub fn missing_keys(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, o)| !o.is_matched())
            .map(|(k, _)| k)
            .collect()
    }

    pub fn counts(&self) -> OutcomeCounts {
        self.outcomes
            .values()
            .fold(OutcomeCounts::default(), |mut acc, o| {
                if o.is_matched() {
                    acc.matched += 1;
                } else {
                    acc.missing += 1;
                }
                acc
            })
    }
}

/// Compare an expected population against observed evidence.
///
/// When `observed` is empty and a `fallback` index is supplied, the fallback
/// is consulted instead and every outcome is tagged `fallback-*`. A
/// non-empty `observed` index never triggers the fallback.
pub fn reconcile<E, O: Clone>(
    expected: &IdentityIndex<E>,
    observed: &IdentityIndex<O>,
    fallback: Option<&IdentityIndex<O>>,
) -> Reconciliation<O> {
    let (source, used_fallback) = match fallback {
        Some(fallback) if observed.is_empty() => (fallback, true),
        _ => (observed, false),
    };

    let outcomes = expected
        .keys()
        .map(|key| {
            let outcome = match (source.get(key), used_fallback) {
                (Some(detail), false) => Outcome::Matched(detail.clone()),
                (None, false) => Outcome::Missing,
                (Some(detail), true) => Outcome::FallbackMatched(detail.clone()),
                (None, true) => Outcome::FallbackMissing,
            };
            (key.to_string(), outcome)
        })
        .collect();

    Reconciliation {
        outcomes,
        used_fallback,
    }
}

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

/// Display name with the "Unknown" placeholder for null or blank names.
pub fn display_name(name: Option<&str>) -> &str {
    match name {
        Some(n) if !n.trim().is_empty() => n,
        _ => UNKNOWN_NAME,
    }
}

/// Name for detail listings: the raw key is shown next to the placeholder so
/// nameless users stay traceable.
pub fn detail_label(key: &str, name: Option<&str>) -> String {
    match name {
        Some(n) if !n.trim().is_empty() => n.to_string(),
        _ => format!("{UNKNOWN_NAME} ({key})"),
    }
}

/// Scalar cell text; null, absent or empty values render as `-`.
pub fn scalar_label(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) if !s.is_empty() => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        _ => "-".to_string(),
    }
}

/// Seconds as zero-padded `HH:MM:SS`; missing, zero, negative or non-finite
/// durations render as `-`. Sub-second positive values show `00:00:00`.
pub fn format_time(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds else {
        return "-".to_string();
    };
    if !seconds.is_finite() || seconds <= 0.0 {
        return "-".to_string();
    }
    let total = seconds.trunc() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    format!("{hours:02}:{minutes:02}:{secs:02}")
}

/// Calendar date of an ISO-8601 timestamp or date string.
pub fn iso_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    value
        .get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Truncate to at most `width` characters.
pub fn truncate_chars(value: &str, width: usize) -> &str {
    match value.char_indices().nth(width) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub header: String,
    /// Pad to this many characters; `None` leaves the cell as-is.
    pub width: Option<usize>,
    pub truncate: bool,
}

impl Column {
    pub fn new(header: impl Into<String>, width: usize) -> Self {
        Self {
            header: header.into(),
            width: Some(width),
            truncate: false,
        }
    }

    /// Unpadded trailing column.
    pub fn free(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            width: None,
            truncate: false,
        }
    }

    pub fn truncated(mut self) -> Self {
        self.truncate = true;
        self
    }

    fn format_cell(&self, value: &str) -> String {
        match self.width {
            Some(width) => {
                let value = if self.truncate {
                    truncate_chars(value, width)
                } else {
                    value
                };
                format!("{value:<width$}")
            }
            None => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStyle {
    /// Header line followed by one rule.
    Underline { ch: char, width: usize },
    /// Rule, header, rule, rows, closing rule.
    Boxed { ch: char, width: usize },
}

/// Fixed-width table joined with ` | `.
#[derive(Debug, Clone)]
pub struct TextTable {
    columns: Vec<Column>,
    rule: RuleStyle,
    rows: Vec<Vec<String>>,
}

impl TextTable {
    pub fn new(columns: Vec<Column>, rule: RuleStyle) -> Self {
        Self {
            columns,
            rule,
            rows: Vec::new(),
        }
    }

    pub fn push_row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(cells.into_iter().map(Into::into).collect());
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn render_line(&self, cells: &[String]) -> String {
        let line = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| col.format_cell(cells.get(i).map(String::as_str).unwrap_or("")))
            .collect::<Vec<_>>()
            .join(" | ");
        line.trim_end().to_string()
    }

    pub fn render(&self) -> String {
        let header_cells = self
            .columns
            .iter()
            .map(|c| c.header.clone())
            .collect::<Vec<_>>();
        let header = self.render_line(&header_cells);

        let mut lines = Vec::with_capacity(self.rows.len() + 4);
        match self.rule {
            RuleStyle::Underline { ch, width } => {
                lines.push(header);
                lines.push(ch.to_string().repeat(width));
                lines.extend(self.rows.iter().map(|r| self.render_line(r)));
            }
            RuleStyle::Boxed { ch, width } => {
                let rule = ch.to_string().repeat(width);
                lines.push(rule.clone());
                lines.push(header);
                lines.push(rule.clone());
                lines.extend(self.rows.iter().map(|r| self.render_line(r)));
                lines.push(rule);
            }
        }
        lines.join("\n")
    }
}

/// Sorted bullet list, one `- name` per line.
pub fn render_missing_list<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut names = names.into_iter().map(Into::into).collect::<Vec<String>>();
    names.sort();
    let mut out = String::new();
    for name in names {
        let _ = writeln!(out, "- {name}");
    }
    out.trim_end().to_string()
}
