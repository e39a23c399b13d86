//! Diagnostic reports over the Supabase REST surface.
//!
//! Every report follows the same shape: fetch the rows it needs, index them
//! by user id, reconcile the expected population against observed evidence
//! and render plain text. Supplementary lookups (profile names) degrade to
//! placeholders with a warning line; the lookups a report cannot do without
//! abort it with context.

use std::fmt::Display;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use stagecheck_core::{
    detail_label, display_name, format_time, iso_date, reconcile, render_missing_list,
    scalar_label, ActivityRow, Column, DeviceConnection, EventStage, IdentityIndex, Outcome,
    Participant, Profile, Record, RuleStyle, StageResult, TextTable, WorkoutMetric,
};
use stagecheck_rest::{FinalizeRequest, FunctionsClient, Query, RestClient, RestConfig, RestError};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "stagecheck-reports";

pub const STRAVA: &str = "strava";
pub const DEFAULT_PUBLISH_SECONDS: u64 = 3600;

const LATEST_METRICS_LIMIT: usize = 10;
const VISIBILITY_SAMPLE: usize = 5;

/// Everything a diagnostic run reads from the environment.
#[derive(Debug, Clone)]
pub struct DiagConfig {
    pub rest: RestConfig,
    pub default_stage_id: Option<String>,
    /// Overrides "today" for the date-scoped reports.
    pub report_date: Option<NaiveDate>,
}

impl DiagConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let rest = RestConfig::from_lookup(&lookup).context("loading Supabase configuration")?;
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let report_date = var("STAGECHECK_DATE")
            .map(|raw| {
                NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                    .with_context(|| format!("parsing STAGECHECK_DATE={raw} (expected YYYY-MM-DD)"))
            })
            .transpose()?;
        Ok(Self {
            rest,
            default_stage_id: var("STAGECHECK_STAGE_ID"),
            report_date,
        })
    }

    pub fn report_day(&self, now: DateTime<Utc>) -> NaiveDate {
        self.report_date.unwrap_or_else(|| now.date_naive())
    }
}

/// Line buffer for a report; warnings are logged and echoed inline.
#[derive(Debug, Default)]
struct ReportWriter {
    buf: String,
}

impl ReportWriter {
    fn line(&mut self, text: impl AsRef<str>) {
        self.buf.push_str(text.as_ref());
        self.buf.push('\n');
    }

    fn blank(&mut self) {
        self.buf.push('\n');
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.line(format!("Warning: {message}"));
    }

    fn error(&mut self, section: &str, err: impl Display) {
        warn!(section, error = %err, "report section failed");
        self.line(format!("Error {section}: {err}"));
    }

    fn note_skipped<V>(&mut self, source: &str, index: &IdentityIndex<V>) {
        if index.skipped() > 0 {
            self.warn(format!(
                "{} {source} row(s) had no user id and were skipped",
                index.skipped()
            ));
        }
    }

    fn finish(self) -> String {
        self.buf.trim_end().to_string()
    }
}

type NameIndex = IdentityIndex<Option<String>>;

fn name_of<'a>(names: &'a NameIndex, key: &str) -> &'a str {
    display_name(names.get(key).and_then(|n| n.as_deref()))
}

fn label_of(names: &NameIndex, key: &str) -> String {
    detail_label(key, names.get(key).and_then(|n| n.as_deref()))
}

fn names_from(rows: Vec<Profile>) -> NameIndex {
    IdentityIndex::build(rows, |p| p.id.clone(), |p| p.full_name.clone())
}

fn profiles_query() -> Query {
    Query::table("profiles").select(["id", "full_name"])
}

/// Profile names as a supplementary source.
async fn load_profile_names(client: &RestClient, out: &mut ReportWriter) -> NameIndex {
    match client.fetch_as::<Profile>(&profiles_query()).await {
        Ok(rows) => {
            let names = names_from(rows);
            out.note_skipped("profiles", &names);
            names
        }
        Err(err) => {
            out.warn(format!("could not load profile names, showing placeholders: {err}"));
            IdentityIndex::empty()
        }
    }
}

/// Stage row plus its owning event id. A stage that does not exist or has
/// no event aborts the report.
pub async fn resolve_stage(client: &RestClient, stage_id: &str) -> Result<(EventStage, String)> {
    let query = Query::table("event_stages")
        .select(["id", "event_id", "name", "start_date"])
        .eq("id", stage_id);
    let stage: EventStage = client
        .fetch_first_as(&query)
        .await
        .with_context(|| format!("could not find event for stage {stage_id}"))?;
    let event_id = stage
        .event_id
        .clone()
        .with_context(|| format!("stage {stage_id} has no event_id"))?;
    debug!(stage_id, event_id = %event_id, "resolved stage");
    Ok((stage, event_id))
}

fn day_bounds(day: NaiveDate) -> (String, String) {
    (format!("{day}T00:00:00"), format!("{day}T23:59:59"))
}

fn strava_uploads_on(day: NaiveDate, columns: &[&str]) -> Query {
    let (start, end) = day_bounds(day);
    Query::table("workout_metrics")
        .select(columns.iter().copied())
        .eq("source_platform", STRAVA)
        .gte("start_time", start)
        .lte("start_time", end)
}

fn joined_label(joined_at: Option<&str>) -> String {
    match joined_at {
        Some(raw) => iso_date(raw)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| raw.to_string()),
        None => "N/A".to_string(),
    }
}

fn or_none(value: Option<&str>) -> &str {
    value.unwrap_or("None")
}

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

pub async fn connections_report(client: &RestClient, stage_id: &str) -> Result<String> {
    let mut out = ReportWriter::default();
    out.line("--- Event Participants - Connection Status ---");
    out.line(format!("Stage ID: {stage_id}"));

    let (_, event_id) = resolve_stage(client, stage_id).await?;
    out.line(format!("Event ID: {event_id}"));
    out.blank();

    let participants: Vec<Participant> = client
        .fetch_as(
            &Query::table("event_participants")
                .select(["user_id"])
                .eq("event_id", &event_id),
        )
        .await
        .context("fetching event participants")?;
    let registered = IdentityIndex::build(participants, |p| p.user_id.clone(), |_| ());
    out.note_skipped("event_participants", &registered);

    let names = load_profile_names(client, &mut out).await;

    let connections: Vec<DeviceConnection> = client
        .fetch_as(
            &Query::table("device_connections")
                .select(["user_id", "is_active"])
                .eq("platform", STRAVA),
        )
        .await
        .context("fetching Strava connections")?;
    // observed side holds active links only
    let connected = IdentityIndex::build(
        connections.iter().filter(|c| c.is_active()),
        |c| c.user_id.clone(),
        |_| (),
    );
    out.note_skipped("device_connections", &connected);

    let outcome = reconcile(&registered, &connected, None);
    let mut rows = outcome
        .iter()
        .map(|(uid, o)| {
            (name_of(&names, uid), uid, if o.is_matched() { "YES" } else { "NO" })
        })
        .collect::<Vec<_>>();
    rows.sort();

    let mut table = TextTable::new(
        vec![
            Column::new("Athlete", 30).truncated(),
            Column::new("Strava Connected?", 20),
        ],
        RuleStyle::Underline { ch: '-', width: 55 },
    );
    for (name, _, status) in &rows {
        table.push_row([name.to_string(), status.to_string()]);
    }
    let active = outcome.counts().matched;
    out.line(table.render());
    out.blank();
    out.line(format!(
        "Connected: {active} of {} participants",
        registered.len()
    ));
    info!(stage_id, participants = registered.len(), active, "connections report");
    Ok(out.finish())
}

// ---------------------------------------------------------------------------
// Stage participation
// ---------------------------------------------------------------------------

/// What counts as a participant having done the stage.
#[derive(Debug, Clone, PartialEq)]
enum StageEvidence {
    Result(StageResult),
    /// Strava workout on the stage date, used before any result exists.
    Upload(WorkoutMetric),
}

impl StageEvidence {
    fn cells(&self) -> [String; 4] {
        match self {
            Self::Result(r) => [
                "YES".to_string(),
                r.status_label().to_string(),
                format_time(r.elapsed_time_seconds),
                r.activity_id_label(),
            ],
            Self::Upload(w) => [
                "UPLOADED".to_string(),
                "upload".to_string(),
                format_time(w.elapsed_time),
                scalar_label(w.id.as_ref()),
            ],
        }
    }
}

async fn stage_day_uploads(
    client: &RestClient,
    stage: &EventStage,
    out: &mut ReportWriter,
) -> Option<(NaiveDate, IdentityIndex<StageEvidence>)> {
    let day = stage.start_date.as_deref().and_then(iso_date)?;
    let query = strava_uploads_on(day, &["id", "user_id", "start_time", "elapsed_time"])
        .order_asc("start_time");
    match client.fetch_as::<WorkoutMetric>(&query).await {
        Ok(rows) => {
            let uploads = IdentityIndex::build(
                rows,
                |w| w.user_id.clone(),
                |w| StageEvidence::Upload(w.clone()),
            );
            out.note_skipped("workout_metrics", &uploads);
            Some((day, uploads))
        }
        Err(err) => {
            out.warn(format!("could not load Strava uploads for {day}: {err}"));
            None
        }
    }
}

pub async fn participation_report(
    client: &RestClient,
    stage_id: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut out = ReportWriter::default();
    out.line("--- Event Participants - Stage Status ---");
    out.line(format!("Stage ID: {stage_id}"));
    out.line(format!("Report Time: {}", now.format("%Y-%m-%d %H:%M:%S")));
    out.blank();

    let (stage, event_id) = resolve_stage(client, stage_id).await?;
    out.line(format!("Stage Name: {}", stage.name.as_deref().unwrap_or("-")));
    out.line(format!("Event ID: {event_id}"));
    out.blank();

    let names = load_profile_names(client, &mut out).await;

    let participants: Vec<Participant> = client
        .fetch_as(
            &Query::table("event_participants")
                .select(["user_id", "joined_at"])
                .eq("event_id", &event_id),
        )
        .await
        .context("fetching registered participants")?;
    let registered = IdentityIndex::build(
        participants,
        |p| p.user_id.clone(),
        |p| p.joined_at.clone(),
    );
    out.note_skipped("event_participants", &registered);
    out.line(format!("Registered Athletes: {}", registered.len()));
    out.blank();

    let results: Vec<StageResult> = client
        .fetch_as(&Query::table("stage_results").eq("stage_id", stage_id))
        .await
        .context("fetching stage results")?;
    let observed = IdentityIndex::build(
        results,
        |r| r.user_id.clone(),
        |r| StageEvidence::Result(r.clone()),
    );
    out.note_skipped("stage_results", &observed);

    let fallback = if observed.is_empty() {
        stage_day_uploads(client, &stage, &mut out).await
    } else {
        None
    };
    let outcome = reconcile(
        &registered,
        &observed,
        fallback.as_ref().map(|(_, index)| index),
    );
    if let Some((day, _)) = fallback.as_ref().filter(|_| outcome.used_fallback()) {
        out.warn(format!(
            "no stage results yet; matching Strava uploads on {day} instead"
        ));
        out.blank();
    }

    let mut keys = outcome.iter().map(|(uid, _)| uid).collect::<Vec<_>>();
    keys.sort_by_key(|uid| (name_of(&names, uid), *uid));

    let mut table = TextTable::new(
        vec![
            Column::new("Athlete", 25).truncated(),
            Column::new("Registered", 12),
            Column::new("Has Result", 10),
            Column::new("Status", 10),
            Column::new("Elapsed Time", 12),
            Column::free("Activity ID"),
        ],
        RuleStyle::Boxed { ch: '=', width: 100 },
    );
    for uid in &keys {
        let joined = registered.get(uid).and_then(|j| j.as_deref());
        let [has, status, elapsed, activity] = match outcome.get(uid).and_then(Outcome::detail) {
            Some(evidence) => evidence.cells(),
            None => ["NO", "-", "-", "-"].map(String::from),
        };
        table.push_row([
            name_of(&names, uid).to_string(),
            joined_label(joined),
            has,
            status,
            elapsed,
            activity,
        ]);
    }
    out.line(table.render());
    out.blank();

    let counts = outcome.counts();
    let evidence = if outcome.used_fallback() { "uploads" } else { "results" };
    out.line(format!(
        "Summary: {} with {evidence}, {} without {evidence} (out of {} registered)",
        counts.matched,
        counts.missing,
        registered.len()
    ));

    let mut missing = outcome.missing_keys();
    if !missing.is_empty() {
        missing.sort_by_key(|uid| (name_of(&names, uid), *uid));
        out.blank();
        out.line("--- Missing Users Detail ---");
        for uid in missing {
            out.line(format!("Missing: {} (ID: {uid})", name_of(&names, uid)));
        }
    }
    info!(
        stage_id,
        matched = counts.matched,
        missing = counts.missing,
        fallback = outcome.used_fallback(),
        "participation report"
    );
    Ok(out.finish())
}

// ---------------------------------------------------------------------------
// Pending uploads
// ---------------------------------------------------------------------------

pub async fn missing_uploads_report(client: &RestClient, today: NaiveDate) -> Result<String> {
    let mut out = ReportWriter::default();
    out.line("--- Users Pending Strava Upload for Today ---");
    out.line(format!("Date: {today}"));
    out.blank();

    let profiles: Vec<Profile> = client
        .fetch_as(&profiles_query())
        .await
        .context("fetching profiles")?;
    let names = names_from(profiles);
    out.note_skipped("profiles", &names);

    let connections: Vec<DeviceConnection> = client
        .fetch_as(
            &Query::table("device_connections")
                .select(["user_id"])
                .eq("platform", STRAVA)
                .is_true("is_active"),
        )
        .await
        .context("fetching active Strava connections")?;
    let connected = IdentityIndex::build(connections, |c| c.user_id.clone(), |_| ());
    out.note_skipped("device_connections", &connected);
    out.line(format!(
        "Total users with active Strava connection (from device_connections): {}",
        connected.len()
    ));

    let historical = connected.is_empty();
    let expected = if historical {
        out.warn(
            "no active connections in device_connections; falling back to historical Strava uploaders",
        );
        let history = Query::table("workout_metrics")
            .select(["user_id"])
            .eq("source_platform", STRAVA);
        match client.fetch_as::<WorkoutMetric>(&history).await {
            Ok(rows) => {
                let uploaders = IdentityIndex::build(rows, |w| w.user_id.clone(), |_| ());
                out.note_skipped("workout_metrics", &uploaders);
                out.line(format!(
                    "Found {} users with historical Strava activities.",
                    uploaders.len()
                ));
                uploaders
            }
            Err(err) => {
                out.warn(format!("could not load historical Strava uploaders: {err}"));
                connected
            }
        }
    } else {
        connected
    };

    let uploads: Vec<WorkoutMetric> = client
        .fetch_as(&strava_uploads_on(today, &["user_id", "start_time"]))
        .await
        .context("fetching today's Strava uploads")?;
    let uploaded = IdentityIndex::build(uploads, |w| w.user_id.clone(), |_| ());
    out.note_skipped("workout_metrics", &uploaded);
    out.line(format!(
        "Total users with activities today: {}",
        uploaded.len()
    ));

    let outcome = reconcile(&expected, &uploaded, None);
    let missing = outcome.missing_keys();

    let banner = "=".repeat(50);
    out.blank();
    out.line(&banner);
    out.line(format!("MISSING ACTIVITIES ({} users)", missing.len()));
    out.line(&banner);
    if missing.is_empty() {
        let population = if historical {
            "Every historical Strava uploader"
        } else {
            "Everyone with a Strava connection"
        };
        out.line(format!("Great news! {population} has uploaded today."));
    } else {
        out.line(render_missing_list(
            missing.iter().map(|uid| label_of(&names, uid)),
        ));
    }
    info!(%today, expected = expected.len(), missing = missing.len(), "missing uploads report");
    Ok(out.finish())
}

// ---------------------------------------------------------------------------
// Latest activity
// ---------------------------------------------------------------------------

pub async fn latest_activity_report(client: &RestClient, now: DateTime<Utc>) -> Result<String> {
    let mut out = ReportWriter::default();
    out.line("--- Latest Strava Activity per Athlete ---");
    out.line(format!("Current UTC Time: {}", now.format("%Y-%m-%d %H:%M:%S")));
    out.blank();

    let names = load_profile_names(client, &mut out).await;

    let rows: Vec<WorkoutMetric> = client
        .fetch_as(
            &Query::table("workout_metrics")
                .select(["title", "start_time", "user_id", "source_platform"])
                .eq("source_platform", STRAVA)
                .order_desc("start_time"),
        )
        .await
        .context("fetching Strava workouts")?;
    if rows.is_empty() {
        out.line("No Strava activities found in the database.");
        return Ok(out.finish());
    }

    // newest first on the wire; build from the tail so the newest row per user wins
    let latest = IdentityIndex::build(rows.iter().rev(), |w| w.user_id.clone(), |w| (*w).clone());
    out.note_skipped("workout_metrics", &latest);

    let mut entries = latest.iter().collect::<Vec<_>>();
    entries.sort_by(|a, b| {
        b.1.start_time
            .cmp(&a.1.start_time)
            .then_with(|| a.0.cmp(b.0))
    });

    let today = now.date_naive();
    let mut table = TextTable::new(
        vec![
            Column::new("Athlete", 20).truncated(),
            Column::new("Latest Activity", 30).truncated(),
            Column::new("Date", 12),
            Column::free("Today?"),
        ],
        RuleStyle::Underline { ch: '-', width: 80 },
    );
    for (uid, workout) in &entries {
        let date = workout.start_time.as_deref().and_then(iso_date);
        table.push_row([
            name_of(&names, uid).to_string(),
            workout.title.clone().unwrap_or_else(|| "No Title".to_string()),
            date.map(|d| d.to_string())
                .unwrap_or_else(|| "Unknown".to_string()),
            if date == Some(today) { "YES" } else { "" }.to_string(),
        ]);
    }
    out.line(table.render());
    out.blank();
    out.line(format!(
        "Total athletes with Strava activities: {}",
        latest.len()
    ));
    Ok(out.finish())
}

// ---------------------------------------------------------------------------
// Raw visibility checks
// ---------------------------------------------------------------------------

/// Row counts and samples across the tables uploads land in. Each section
/// reports its own failure and the rest still run.
pub async fn visibility_report(client: &RestClient, today: NaiveDate) -> Result<String> {
    let mut out = ReportWriter::default();
    out.line("--- Debugging Activities Visibility ---");
    out.line(format!("Date: {today}"));
    out.blank();

    let metrics = Query::table("workout_metrics").select(["user_id", "start_time", "source_platform"]);
    match client.fetch(&metrics).await {
        Ok(mut rows) => {
            let users = IdentityIndex::from_records(&rows, "user_id", |_| ());
            out.note_skipped("workout_metrics", &users);
            out.line(format!("Total activities found in workout_metrics: {}", rows.len()));
            out.line(format!("Total distinct users with activities: {}", users.len()));
            out.blank();
            rows.sort_by(|a, b| b.str_field("start_time").cmp(&a.str_field("start_time")));
            out.line(format!("Last {VISIBILITY_SAMPLE} activities:"));
            for row in rows.iter().take(VISIBILITY_SAMPLE) {
                out.line(format!(
                    "User: {}, Time: {}, Platform: {}",
                    or_none(row.str_field("user_id")),
                    or_none(row.str_field("start_time")),
                    or_none(row.str_field("source_platform")),
                ));
            }
        }
        Err(err) => out.error("workout_metrics", err),
    }
    out.blank();

    match client.fetch(&profiles_query()).await {
        Ok(rows) => {
            out.line(format!("Total profiles found: {}", rows.len()));
            for row in rows.iter().take(VISIBILITY_SAMPLE) {
                out.line(format!(
                    "Profile: {}, Name: {}",
                    row.key_field("id").unwrap_or_else(|| "None".to_string()),
                    display_name(row.str_field("full_name")),
                ));
            }
        }
        Err(err) => out.error("profiles", err),
    }
    out.blank();

    let activities = Query::table("activities").select(["user_id", "date", "source"]);
    match client.fetch_as::<ActivityRow>(&activities).await {
        Ok(rows) => {
            out.line(format!("Total activities found in activities table: {}", rows.len()));
            let todays = rows
                .iter()
                .filter(|a| a.date.as_deref().and_then(iso_date) == Some(today))
                .collect::<Vec<_>>();
            let users = IdentityIndex::build(todays.iter(), |a| a.user_id.clone(), |_| ());
            out.note_skipped("activities", &users);
            out.line(format!(
                "Activities found for today in activities table: {}",
                todays.len()
            ));
            out.line(format!("Distinct users with activities today: {}", users.len()));
            for row in &todays {
                out.line(format!(
                    "User: {}, Time: {}, Source: {}",
                    or_none(row.user_id.as_deref()),
                    or_none(row.date.as_deref()),
                    or_none(row.source.as_deref()),
                ));
            }
        }
        Err(err) => out.error("activities", err),
    }
    Ok(out.finish())
}

// ---------------------------------------------------------------------------
// Per-user debugging
// ---------------------------------------------------------------------------

pub async fn user_debug_report(
    client: &RestClient,
    user_ids: &[String],
    day: NaiveDate,
) -> Result<String> {
    let mut out = ReportWriter::default();
    out.line("--- Debugging Strava Users ---");
    out.line(format!("Target Date: {day}"));
    out.blank();

    let names = load_profile_names(client, &mut out).await;

    for uid in user_ids {
        out.line(format!("Checking: {} ({uid})", name_of(&names, uid)));

        let connection = Query::table("device_connections")
            .eq("user_id", uid)
            .eq("platform", STRAVA);
        match client.fetch_as::<DeviceConnection>(&connection).await {
            Ok(rows) => match rows.first() {
                Some(conn) => out.line(format!(
                    "  > Strava Connection: FOUND (Active: {})",
                    conn.is_active()
                )),
                None => out.line("  > Strava Connection: NOT FOUND"),
            },
            Err(err) => out.line(format!("  > Error checking connection: {err}")),
        }

        let uploads = strava_uploads_on(day, &["id", "start_time", "name", "distance", "elapsed_time"])
            .eq("user_id", uid);
        match client.fetch_as::<WorkoutMetric>(&uploads).await {
            Ok(rows) if rows.is_empty() => out.line(format!(
                "  > Activities on {day}: NONE FOUND in workout_metrics"
            )),
            Ok(rows) => {
                out.line(format!("  > Activities on {day}: {}", rows.len()));
                for w in &rows {
                    out.line(format!(
                        "    - {}: {} (Dist: {}m, Time: {}s)",
                        or_none(w.start_time.as_deref()),
                        w.name.as_deref().unwrap_or("No Name"),
                        w.distance.unwrap_or(0.0),
                        w.elapsed_time.unwrap_or(0.0),
                    ));
                }
            }
            Err(err) => out.line(format!("  > Error checking activities: {err}")),
        }
        out.blank();
    }
    Ok(out.finish())
}

// ---------------------------------------------------------------------------
// Table dumps
// ---------------------------------------------------------------------------

pub async fn stages_report(client: &RestClient) -> Result<String> {
    let rows: Vec<EventStage> = client
        .fetch_as(
            &Query::table("event_stages")
                .select(["id", "event_id", "name", "stage_number", "start_date"])
                .order_asc("start_date"),
        )
        .await
        .context("listing event stages")?;

    let mut out = ReportWriter::default();
    out.line("--- Stages ---");
    if rows.is_empty() {
        out.line("No stages found.");
    }
    for stage in &rows {
        out.line(format!(
            "ID: {} | Event: {} | Stage {} - {} | Date: {}",
            or_none(stage.id.as_deref()),
            or_none(stage.event_id.as_deref()),
            stage
                .stage_number
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string()),
            or_none(stage.name.as_deref()),
            or_none(stage.start_date.as_deref()),
        ));
    }
    Ok(out.finish())
}

pub async fn inspect_stages_report(client: &RestClient) -> Result<String> {
    let rows = client
        .fetch(&Query::table("event_stages").limit(1))
        .await
        .context("sampling event_stages")?;

    let mut out = ReportWriter::default();
    match rows.first() {
        Some(sample) => {
            out.line(format!(
                "Columns: {}",
                sample.column_names().collect::<Vec<_>>().join(", ")
            ));
            out.line(format!("Sample: {}", serde_json::to_string(sample)?));
        }
        None => out.line("No stages found."),
    }
    Ok(out.finish())
}

fn with_auth_hint(err: RestError, what: &str) -> anyhow::Error {
    let hint = matches!(err.status(), Some(401 | 403));
    let err = anyhow::Error::new(err);
    if hint {
        err.context(format!(
            "{what} was rejected; check SUPABASE_ANON_KEY and row-level security policies"
        ))
    } else {
        err.context(what.to_string())
    }
}

pub async fn leaderboard_report(client: &RestClient) -> Result<String> {
    let mut out = ReportWriter::default();
    out.line("Checking 'event_leaderboard' table...");
    let rows: Vec<Record> = client
        .fetch(&Query::table("event_leaderboard"))
        .await
        .map_err(|err| with_auth_hint(err, "reading event_leaderboard"))?;
    out.line(format!("Found {} rows.", rows.len()));
    out.line(serde_json::to_string_pretty(&rows).context("rendering leaderboard rows")?);
    Ok(out.finish())
}

pub async fn metrics_report(client: &RestClient) -> Result<String> {
    let mut out = ReportWriter::default();
    out.line(format!("Connecting to {}...", client.config().base_url));
    let rows: Vec<WorkoutMetric> = client
        .fetch_as(
            &Query::table("workout_metrics")
                .order_desc("start_time")
                .limit(LATEST_METRICS_LIMIT),
        )
        .await
        .map_err(|err| with_auth_hint(err, "reading workout_metrics"))?;

    out.line(format!("Items found: {}", rows.len()));
    if rows.is_empty() {
        out.line("Table 'workout_metrics' is empty.");
        return Ok(out.finish());
    }
    out.line(format!("Most recent {LATEST_METRICS_LIMIT} activities:"));
    for w in &rows {
        out.line(format!(
            "- Date: {}, Title: {}, Type: {}",
            or_none(w.start_time.as_deref()),
            or_none(w.title.as_deref()),
            or_none(w.kind.as_deref()),
        ));
    }
    Ok(out.finish())
}

// ---------------------------------------------------------------------------
// Serverless endpoint checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PublishedStage {
    meta: Option<PublishedMeta>,
    results: Vec<PublishedResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PublishedMeta {
    stage_name: Option<String>,
    event_title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PublishedResult {
    elapsed_time_seconds: Option<f64>,
    status: Option<String>,
    user: Option<PublishedUser>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PublishedUser {
    full_name: Option<String>,
}

pub async fn fetch_results_report(functions: &FunctionsClient, stage_id: &str) -> Result<String> {
    let mut out = ReportWriter::default();
    out.line(format!("Testing fetch-stage-results for Stage ID: {stage_id}"));
    out.line("-".repeat(50));
    out.line(format!(
        "Requesting: {}?stage_id={stage_id}",
        functions.function_url(stagecheck_rest::FETCH_STAGE_RESULTS)
    ));

    let resp = functions
        .fetch_stage_results(stage_id)
        .await
        .context("calling fetch-stage-results")?;
    out.line(format!("Status Code: {}", resp.status));
    out.line(if resp.json().is_some() {
        "Response JSON:"
    } else {
        "Response Text (Not JSON):"
    });
    out.line(resp.pretty_body());

    if let Some(message) = resp.error_message() {
        out.warn(format!("endpoint reported an error: {message}"));
    }

    match resp.decode::<PublishedStage>() {
        Some(Ok(published)) if !published.results.is_empty() => {
            out.blank();
            if let Some(meta) = &published.meta {
                out.line(format!(
                    "Stage: {} ({})",
                    or_none(meta.stage_name.as_deref()),
                    or_none(meta.event_title.as_deref()),
                ));
            }
            let mut table = TextTable::new(
                vec![
                    Column::new("#", 3),
                    Column::new("Athlete", 25).truncated(),
                    Column::new("Elapsed", 10),
                    Column::free("Status"),
                ],
                RuleStyle::Underline { ch: '-', width: 60 },
            );
            for (i, r) in published.results.iter().enumerate() {
                let name = r.user.as_ref().and_then(|u| u.full_name.as_deref());
                table.push_row([
                    (i + 1).to_string(),
                    display_name(name).to_string(),
                    format_time(r.elapsed_time_seconds),
                    r.status.clone().unwrap_or_else(|| "-".to_string()),
                ]);
            }
            out.line(table.render());
        }
        Some(Err(err)) => debug!(error = %err, "results payload did not match the expected shape"),
        _ => {}
    }

    if resp.results_pending() {
        out.blank();
        out.line("[WARNING] Results array is empty!");
        out.line(
            "If you just ran the calculation, wait 10-20 seconds for background processing and try again.",
        );
    }
    Ok(out.finish())
}

pub async fn publish_results_report(
    functions: &FunctionsClient,
    request: &FinalizeRequest,
) -> Result<String> {
    let mut out = ReportWriter::default();
    out.line(format!(
        "Testing PUBLISH (finalize-stage-results) for Stage ID: {}",
        request.stage_id
    ));
    out.line("-".repeat(50));
    out.line("Sending Payload:");
    out.line(serde_json::to_string_pretty(request).context("rendering finalize payload")?);
    out.blank();

    let resp = functions
        .finalize_stage_results(request)
        .await
        .context("calling finalize-stage-results")?;
    out.line(format!("Status Code: {}", resp.status));
    out.line("Response Text:");
    out.line(resp.pretty_body());
    if !resp.is_success() {
        warn!(status = resp.status, "finalize-stage-results rejected the payload");
    }
    Ok(out.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value as JsonValue};
    use stagecheck_rest::{RawResponse, Transport};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const STAGE: &str = "f39d952a-147b-4b26-af0b-f6a9f0236e94";

    /// Serves canned tables and applies the PostgREST filters the reports use.
    #[derive(Default)]
    struct TableTransport {
        tables: HashMap<String, Vec<JsonValue>>,
        failures: HashMap<String, u16>,
        functions: HashMap<String, (u16, String)>,
        calls: Mutex<Vec<String>>,
    }

    impl TableTransport {
        fn table(mut self, name: &str, rows: JsonValue) -> Self {
            let rows = rows.as_array().cloned().unwrap_or_default();
            self.tables.insert(name.to_string(), rows);
            self
        }

        fn failing(mut self, name: &str, status: u16) -> Self {
            self.failures.insert(name.to_string(), status);
            self
        }

        fn function(mut self, name: &str, status: u16, body: &str) -> Self {
            self.functions
                .insert(name.to_string(), (status, body.to_string()));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn cell(row: &JsonValue, column: &str) -> Option<String> {
        match row.get(column)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Null => None,
            other => Some(other.to_string()),
        }
    }

    fn keep(row: &JsonValue, column: &str, filter: &str) -> bool {
        let Some((op, value)) = filter.split_once('.') else {
            return true;
        };
        let cell = cell(row, column);
        match op {
            "eq" => cell.as_deref() == Some(value),
            "neq" => cell.as_deref() != Some(value),
            "gte" => cell.is_some_and(|c| c.as_str() >= value),
            "lte" => cell.is_some_and(|c| c.as_str() <= value),
            "gt" => cell.is_some_and(|c| c.as_str() > value),
            "lt" => cell.is_some_and(|c| c.as_str() < value),
            _ => true,
        }
    }

    #[async_trait]
    impl Transport for TableTransport {
        async fn get(
            &self,
            url: &str,
            query: &[(String, String)],
            _headers: &[(String, String)],
        ) -> Result<RawResponse, RestError> {
            let name = url.rsplit('/').next().unwrap_or_default().to_string();
            self.calls.lock().unwrap().push(name.clone());

            if let Some((status, body)) = self.functions.get(&name) {
                return Ok(RawResponse {
                    status: *status,
                    url: url.to_string(),
                    body: body.clone(),
                });
            }
            if let Some(status) = self.failures.get(&name) {
                return Ok(RawResponse {
                    status: *status,
                    url: url.to_string(),
                    body: "{\"message\":\"denied\"}".to_string(),
                });
            }

            let mut rows = self.tables.get(&name).cloned().unwrap_or_default();
            let mut limit = None;
            for (key, value) in query {
                match key.as_str() {
                    "select" => {}
                    "limit" => limit = value.parse::<usize>().ok(),
                    "order" => {
                        let (column, dir) = value.split_once('.').unwrap_or((value.as_str(), "asc"));
                        rows.sort_by_key(|r| cell(r, column));
                        if dir == "desc" {
                            rows.reverse();
                        }
                    }
                    column => rows.retain(|r| keep(r, column, value)),
                }
            }
            if let Some(limit) = limit {
                rows.truncate(limit);
            }
            Ok(RawResponse {
                status: 200,
                url: url.to_string(),
                body: JsonValue::Array(rows).to_string(),
            })
        }

        async fn post_json(
            &self,
            url: &str,
            body: &JsonValue,
            _headers: &[(String, String)],
        ) -> Result<RawResponse, RestError> {
            let name = url.rsplit('/').next().unwrap_or_default().to_string();
            self.calls.lock().unwrap().push(format!("POST {name} {body}"));
            let (status, body) = self
                .functions
                .get(&name)
                .cloned()
                .unwrap_or((404, "not found".to_string()));
            Ok(RawResponse {
                status,
                url: url.to_string(),
                body,
            })
        }
    }

    fn config() -> RestConfig {
        RestConfig::new("https://demo.supabase.co", "anon")
    }

    fn client(transport: TableTransport) -> (RestClient, Arc<TableTransport>) {
        let transport = Arc::new(transport);
        (RestClient::with_transport(config(), transport.clone()), transport)
    }

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn stage_fixture() -> TableTransport {
        TableTransport::default()
            .table(
                "event_stages",
                json!([{"id": STAGE, "event_id": "ev-1", "name": "Prologue", "start_date": "2026-02-04", "stage_number": 1}]),
            )
            .table(
                "event_participants",
                json!([
                    {"event_id": "ev-1", "user_id": "u-ann", "joined_at": "2026-01-20T09:15:00+00:00"},
                    {"event_id": "ev-1", "user_id": "u-bob", "joined_at": null},
                    {"event_id": "ev-1", "user_id": "u-cat", "joined_at": "2026-01-22T10:00:00"},
                    {"event_id": "ev-2", "user_id": "u-dan"}
                ]),
            )
            .table(
                "profiles",
                json!([
                    {"id": "u-ann", "full_name": "Ann Rider"},
                    {"id": "u-bob", "full_name": "Bob Climber"},
                    {"id": "u-cat", "full_name": null}
                ]),
            )
    }

    #[tokio::test]
    async fn connections_marks_inactive_and_absent_as_no() {
        let transport = stage_fixture().table(
            "device_connections",
            json!([
                {"user_id": "u-ann", "platform": "strava", "is_active": true},
                {"user_id": "u-bob", "platform": "strava", "is_active": false},
                {"user_id": "u-dan", "platform": "strava", "is_active": true}
            ]),
        );
        let (client, transport) = client(transport);

        let report = connections_report(&client, STAGE).await.unwrap();

        assert!(report.contains(&format!("{:<30} | YES", "Ann Rider")));
        assert!(report.contains(&format!("{:<30} | NO", "Bob Climber")));
        assert!(report.contains(&format!("{:<30} | NO", "Unknown")));
        assert!(!report.contains("u-dan"));
        assert!(report.contains("Connected: 1 of 3 participants"));
        assert_eq!(
            transport.calls(),
            vec!["event_stages", "event_participants", "profiles", "device_connections"]
        );
    }

    #[tokio::test]
    async fn participation_lists_missing_users_with_ids() {
        let transport = stage_fixture().table(
            "stage_results",
            json!([
                {"stage_id": STAGE, "user_id": "u-ann", "status": "official", "elapsed_time_seconds": 3725, "strava_activity_id": 987654321},
                {"stage_id": STAGE, "user_id": "u-cat", "status": null, "elapsed_time_seconds": null},
                {"stage_id": "other", "user_id": "u-bob", "status": "official"}
            ]),
        );
        let (client, _) = client(transport);

        let report = participation_report(&client, STAGE, at("2026-02-04T18:30:00Z"))
            .await
            .unwrap();

        assert!(report.contains("Stage Name: Prologue"));
        assert!(report.contains("Registered Athletes: 3"));
        assert!(report.contains("01:02:05"));
        assert!(report.contains("987654321"));
        assert!(report.contains("2026-01-20"));
        assert!(report.contains("pending"));
        assert!(report.contains("Summary: 2 with results, 1 without results (out of 3 registered)"));
        assert!(report.contains("--- Missing Users Detail ---"));
        assert!(report.contains("Missing: Bob Climber (ID: u-bob)"));
        assert!(!report.contains("Warning"));
    }

    #[tokio::test]
    async fn participation_falls_back_to_uploads_on_stage_day() {
        let transport = stage_fixture()
            .table("stage_results", json!([]))
            .table(
                "workout_metrics",
                json!([
                    {"id": 41, "user_id": "u-bob", "source_platform": "strava", "start_time": "2026-02-04T07:10:00+00:00", "elapsed_time": 1800},
                    {"id": 42, "user_id": "u-ann", "source_platform": "strava", "start_time": "2026-02-03T07:10:00+00:00", "elapsed_time": 1500}
                ]),
            );
        let (client, _) = client(transport);

        let report = participation_report(&client, STAGE, at("2026-02-04T18:30:00Z"))
            .await
            .unwrap();

        assert!(report.contains("Warning: no stage results yet; matching Strava uploads on 2026-02-04 instead"));
        assert!(report.contains("UPLOADED"));
        assert!(report.contains("00:30:00"));
        assert!(report.contains("Summary: 1 with uploads, 2 without uploads (out of 3 registered)"));
        assert!(report.contains("Missing: Ann Rider (ID: u-ann)"));
    }

    #[tokio::test]
    async fn participation_aborts_when_stage_is_unknown() {
        let (client, transport) = client(TableTransport::default().table("event_stages", json!([])));

        let err = participation_report(&client, STAGE, at("2026-02-04T18:30:00Z"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("could not find event"));
        assert_eq!(transport.calls(), vec!["event_stages"]);
    }

    #[tokio::test]
    async fn missing_profiles_degrade_to_placeholder() {
        let transport = stage_fixture()
            .failing("profiles", 403)
            .table(
                "device_connections",
                json!([{"user_id": "u-ann", "platform": "strava", "is_active": true}]),
            );
        let (client, _) = client(transport);

        let report = connections_report(&client, STAGE).await.unwrap();

        assert!(report.contains("Warning: could not load profile names"));
        assert!(report.contains(&format!("{:<30} | YES", "Unknown")));
        assert!(!report.contains("Ann Rider"));
    }

    #[tokio::test]
    async fn missing_uploads_lists_sorted_names_and_placeholders() {
        let transport = stage_fixture()
            .table(
                "device_connections",
                json!([
                    {"user_id": "u-ann", "platform": "strava", "is_active": true},
                    {"user_id": "u-bob", "platform": "strava", "is_active": true},
                    {"user_id": "u-cat", "platform": "strava", "is_active": true},
                    {"user_id": "u-dan", "platform": "strava", "is_active": false}
                ]),
            )
            .table(
                "workout_metrics",
                json!([
                    {"user_id": "u-ann", "source_platform": "strava", "start_time": "2026-02-04T06:00:00+00:00"},
                    {"user_id": "u-bob", "source_platform": "strava", "start_time": "2026-02-03T23:00:00+00:00"}
                ]),
            );
        let (client, _) = client(transport);

        let report = missing_uploads_report(&client, day("2026-02-04")).await.unwrap();

        assert!(report.contains("Total users with active Strava connection (from device_connections): 3"));
        assert!(report.contains("Total users with activities today: 1"));
        assert!(report.contains("MISSING ACTIVITIES (2 users)"));
        assert!(report.ends_with("- Bob Climber\n- Unknown (u-cat)"));
    }

    #[tokio::test]
    async fn missing_uploads_falls_back_to_historical_uploaders() {
        let transport = stage_fixture()
            .table("device_connections", json!([]))
            .table(
                "workout_metrics",
                json!([
                    {"user_id": "u-ann", "source_platform": "strava", "start_time": "2026-02-04T06:00:00+00:00"},
                    {"user_id": "u-bob", "source_platform": "strava", "start_time": "2026-01-15T06:00:00+00:00"}
                ]),
            );
        let (client, _) = client(transport);

        let report = missing_uploads_report(&client, day("2026-02-04")).await.unwrap();

        assert!(report.contains("Warning: no active connections"));
        assert!(report.contains("Found 2 users with historical Strava activities."));
        assert!(report.ends_with("- Bob Climber"));
    }

    #[tokio::test]
    async fn missing_uploads_reports_great_news_when_everyone_uploaded() {
        let transport = stage_fixture()
            .table(
                "device_connections",
                json!([{"user_id": "u-ann", "platform": "strava", "is_active": true}]),
            )
            .table(
                "workout_metrics",
                json!([{"user_id": "u-ann", "source_platform": "strava", "start_time": "2026-02-04T12:00:00"}]),
            );
        let (client, _) = client(transport);

        let report = missing_uploads_report(&client, day("2026-02-04")).await.unwrap();

        assert!(report.contains("MISSING ACTIVITIES (0 users)"));
        assert!(report.ends_with("Great news! Everyone with a Strava connection has uploaded today."));
    }

    #[tokio::test]
    async fn great_news_names_historical_population_after_fallback() {
        let transport = stage_fixture()
            .table("device_connections", json!([]))
            .table(
                "workout_metrics",
                json!([{"user_id": "u-ann", "source_platform": "strava", "start_time": "2026-02-04T12:00:00"}]),
            );
        let (client, _) = client(transport);

        let report = missing_uploads_report(&client, day("2026-02-04")).await.unwrap();

        assert!(report.contains("MISSING ACTIVITIES (0 users)"));
        assert!(report.ends_with("Great news! Every historical Strava uploader has uploaded today."));
        assert!(!report.contains("Everyone with a Strava connection"));
    }

    #[tokio::test]
    async fn missing_uploads_notes_upload_rows_without_user_id() {
        let transport = stage_fixture()
            .table(
                "device_connections",
                json!([{"user_id": "u-ann", "platform": "strava", "is_active": true}]),
            )
            .table(
                "workout_metrics",
                json!([
                    {"user_id": "u-ann", "source_platform": "strava", "start_time": "2026-02-04T06:00:00"},
                    {"user_id": null, "source_platform": "strava", "start_time": "2026-02-04T07:00:00"}
                ]),
            );
        let (client, _) = client(transport);

        let report = missing_uploads_report(&client, day("2026-02-04")).await.unwrap();

        assert!(report.contains("Total users with activities today: 1"));
        assert!(report.contains("Warning: 1 workout_metrics row(s) had no user id and were skipped"));
    }

    #[tokio::test]
    async fn historical_fallback_notes_rows_without_user_id() {
        let transport = stage_fixture()
            .table("device_connections", json!([]))
            .table(
                "workout_metrics",
                json!([
                    {"user_id": "u-bob", "source_platform": "strava", "start_time": "2026-01-15T06:00:00"},
                    {"source_platform": "strava", "start_time": "2026-01-16T06:00:00"}
                ]),
            );
        let (client, _) = client(transport);

        let report = missing_uploads_report(&client, day("2026-02-04")).await.unwrap();

        assert!(report.contains("Found 1 users with historical Strava activities."));
        assert!(report.contains("Warning: 1 workout_metrics row(s) had no user id and were skipped"));
        assert!(report.ends_with("- Bob Climber"));
    }

    #[tokio::test]
    async fn visibility_notes_rows_without_user_id() {
        let transport = stage_fixture()
            .table(
                "workout_metrics",
                json!([
                    {"user_id": "u-ann", "source_platform": "strava", "start_time": "2026-02-04T06:00:00"},
                    {"user_id": null, "source_platform": "strava", "start_time": "2026-02-04T07:00:00"}
                ]),
            )
            .table(
                "activities",
                json!([
                    {"user_id": null, "date": "2026-02-04", "source": "strava"},
                    {"user_id": "u-bob", "date": "2026-02-04", "source": "strava"}
                ]),
            );
        let (client, _) = client(transport);

        let report = visibility_report(&client, day("2026-02-04")).await.unwrap();

        assert!(report.contains("Total distinct users with activities: 1"));
        assert!(report.contains("Warning: 1 workout_metrics row(s) had no user id and were skipped"));
        assert!(report.contains("Distinct users with activities today: 1"));
        assert!(report.contains("Warning: 1 activities row(s) had no user id and were skipped"));
    }

    #[tokio::test]
    async fn participant_fetch_failure_aborts_connections_report() {
        let transport = stage_fixture()
            .failing("event_participants", 500)
            .table(
                "device_connections",
                json!([{"user_id": "u-ann", "platform": "strava", "is_active": true}]),
            );
        let (client, transport) = client(transport);

        let err = connections_report(&client, STAGE).await.unwrap_err();

        let chain = format!("{err:#}");
        assert!(chain.contains("fetching event participants"));
        assert!(chain.contains("500"));
        assert_eq!(transport.calls(), vec!["event_stages", "event_participants"]);
    }

    #[tokio::test]
    async fn stage_result_failure_aborts_participation_report() {
        let transport = stage_fixture().failing("stage_results", 503);
        let (client, transport) = client(transport);

        let err = participation_report(&client, STAGE, at("2026-02-04T18:30:00Z"))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("fetching stage results"));
        assert_eq!(
            transport.calls(),
            vec!["event_stages", "profiles", "event_participants", "stage_results"]
        );
    }

    #[tokio::test]
    async fn profile_failure_aborts_missing_uploads_report() {
        let transport = stage_fixture()
            .failing("profiles", 401)
            .table(
                "device_connections",
                json!([{"user_id": "u-ann", "platform": "strava", "is_active": true}]),
            );
        let (client, transport) = client(transport);

        let err = missing_uploads_report(&client, day("2026-02-04")).await.unwrap_err();

        assert!(format!("{err:#}").contains("fetching profiles"));
        assert_eq!(transport.calls(), vec!["profiles"]);
    }

    #[tokio::test]
    async fn any_active_connection_row_counts_as_connected() {
        let transport = stage_fixture().table(
            "device_connections",
            json!([
                {"user_id": "u-ann", "platform": "strava", "is_active": true},
                {"user_id": "u-ann", "platform": "strava", "is_active": false},
                {"user_id": "u-bob", "platform": "strava", "is_active": false},
                {"user_id": "u-bob", "platform": "strava", "is_active": null}
            ]),
        );
        let (client, _) = client(transport);

        let report = connections_report(&client, STAGE).await.unwrap();

        assert!(report.contains(&format!("{:<30} | YES", "Ann Rider")));
        assert!(report.contains(&format!("{:<30} | NO", "Bob Climber")));
        assert!(report.contains("Connected: 1 of 3 participants"));
    }

    #[tokio::test]
    async fn latest_activity_keeps_newest_row_per_user() {
        let transport = stage_fixture().table(
            "workout_metrics",
            json!([
                {"user_id": "u-ann", "source_platform": "strava", "title": "Old spin", "start_time": "2026-02-01T06:00:00+00:00"},
                {"user_id": "u-ann", "source_platform": "strava", "title": "Morning climb", "start_time": "2026-02-04T06:00:00+00:00"},
                {"user_id": "u-bob", "source_platform": "strava", "title": null, "start_time": "2026-02-02T06:00:00+00:00"},
                {"user_id": "u-cat", "source_platform": "garmin", "title": "Not strava", "start_time": "2026-02-04T08:00:00+00:00"}
            ]),
        );
        let (client, _) = client(transport);

        let report = latest_activity_report(&client, at("2026-02-04T20:00:00Z"))
            .await
            .unwrap();

        assert!(report.contains("Morning climb"));
        assert!(!report.contains("Old spin"));
        assert!(!report.contains("Not strava"));
        assert!(report.contains("No Title"));
        let ann = report.find("Ann Rider").unwrap();
        let bob = report.find("Bob Climber").unwrap();
        assert!(ann < bob);
        assert!(report.contains(&format!(
            "{:<20} | {:<30} | {:<12} | YES",
            "Ann Rider", "Morning climb", "2026-02-04"
        )));
        assert!(report.contains("Total athletes with Strava activities: 2"));
    }

    #[tokio::test]
    async fn latest_activity_handles_empty_table() {
        let (client, _) = client(stage_fixture().table("workout_metrics", json!([])));

        let report = latest_activity_report(&client, at("2026-02-04T20:00:00Z"))
            .await
            .unwrap();

        assert!(report.ends_with("No Strava activities found in the database."));
    }

    #[tokio::test]
    async fn visibility_continues_past_failed_sections() {
        let transport = stage_fixture()
            .failing("workout_metrics", 500)
            .table(
                "activities",
                json!([
                    {"user_id": "u-ann", "date": "2026-02-04", "source": "strava"},
                    {"user_id": "u-ann", "date": "2026-02-04T10:00:00", "source": "strava"},
                    {"user_id": "u-bob", "date": "2026-02-01", "source": "manual"}
                ]),
            );
        let (client, _) = client(transport);

        let report = visibility_report(&client, day("2026-02-04")).await.unwrap();

        assert!(report.contains("Error workout_metrics:"));
        assert!(report.contains("Total profiles found: 3"));
        assert!(report.contains("Profile: u-cat, Name: Unknown"));
        assert!(report.contains("Total activities found in activities table: 3"));
        assert!(report.contains("Activities found for today in activities table: 2"));
        assert!(report.contains("Distinct users with activities today: 1"));
    }

    #[tokio::test]
    async fn user_debug_reports_connection_and_uploads() {
        let transport = stage_fixture()
            .table(
                "device_connections",
                json!([{"user_id": "u-ann", "platform": "strava", "is_active": true}]),
            )
            .table(
                "workout_metrics",
                json!([
                    {"id": 1, "user_id": "u-ann", "source_platform": "strava", "name": "Ride", "start_time": "2026-02-04T07:00:00", "distance": 20500.5, "elapsed_time": 3600}
                ]),
            );
        let (client, _) = client(transport);
        let users = vec!["u-ann".to_string(), "u-bob".to_string()];

        let report = user_debug_report(&client, &users, day("2026-02-04"))
            .await
            .unwrap();

        assert!(report.contains("Checking: Ann Rider (u-ann)"));
        assert!(report.contains("  > Strava Connection: FOUND (Active: true)"));
        assert!(report.contains("    - 2026-02-04T07:00:00: Ride (Dist: 20500.5m, Time: 3600s)"));
        assert!(report.contains("Checking: Bob Climber (u-bob)"));
        assert!(report.contains("  > Strava Connection: NOT FOUND"));
        assert!(report.contains("  > Activities on 2026-02-04: NONE FOUND in workout_metrics"));
    }

    #[tokio::test]
    async fn stage_listing_and_inspection() {
        let (client, _) = client(stage_fixture());

        let listing = stages_report(&client).await.unwrap();
        assert!(listing.contains(&format!(
            "ID: {STAGE} | Event: ev-1 | Stage 1 - Prologue | Date: 2026-02-04"
        )));

        let inspect = inspect_stages_report(&client).await.unwrap();
        assert!(inspect.starts_with("Columns: "));
        assert!(inspect.contains("event_id"));
        assert!(inspect.contains("Sample: {"));
    }

    #[tokio::test]
    async fn leaderboard_auth_failure_carries_hint() {
        let (client, _) = client(TableTransport::default().failing("event_leaderboard", 401));

        let err = leaderboard_report(&client).await.unwrap_err();

        assert!(err.to_string().contains("SUPABASE_ANON_KEY"));
    }

    #[tokio::test]
    async fn metrics_reports_empty_table() {
        let (client, _) = client(TableTransport::default().table("workout_metrics", json!([])));

        let report = metrics_report(&client).await.unwrap();

        assert!(report.contains("Connecting to https://demo.supabase.co..."));
        assert!(report.ends_with("Table 'workout_metrics' is empty."));
    }

    #[tokio::test]
    async fn fetch_results_renders_table_and_pending_warning() {
        let published = json!({
            "meta": {"stage_name": "Prologue", "event_title": "Winter Cup"},
            "results": [
                {"elapsed_time_seconds": 3725, "status": "official", "user": {"full_name": "Ann Rider"}},
                {"elapsed_time_seconds": null, "status": "pending", "user": null}
            ]
        });
        let transport = Arc::new(
            TableTransport::default().function("fetch-stage-results", 200, &published.to_string()),
        );
        let functions = FunctionsClient::with_transport(config(), transport);

        let report = fetch_results_report(&functions, STAGE).await.unwrap();
        assert!(report.contains("Status Code: 200"));
        assert!(report.contains("Stage: Prologue (Winter Cup)"));
        assert!(report.contains(&format!("{:<3} | {:<25} | {:<10} | official", "1", "Ann Rider", "01:02:05")));
        assert!(report.contains(&format!("{:<3} | {:<25} | {:<10} | pending", "2", "Unknown", "-")));
        assert!(!report.contains("[WARNING]"));

        let empty = json!({"meta": {}, "results": []}).to_string();
        let transport = Arc::new(TableTransport::default().function("fetch-stage-results", 200, &empty));
        let functions = FunctionsClient::with_transport(config(), transport);
        let report = fetch_results_report(&functions, STAGE).await.unwrap();
        assert!(report.contains("[WARNING] Results array is empty!"));
    }

    #[tokio::test]
    async fn publish_shows_payload_and_rejection() {
        let transport = Arc::new(
            TableTransport::default().function("finalize-stage-results", 400, "Invalid payload"),
        );
        let functions = FunctionsClient::with_transport(config(), transport.clone());
        let request = FinalizeRequest::single(STAGE, "r-1", DEFAULT_PUBLISH_SECONDS);

        let report = publish_results_report(&functions, &request).await.unwrap();

        assert!(report.contains("\"official_time_seconds\": 3600"));
        assert!(report.contains("\"mountain_points\": 10"));
        assert!(report.contains("Status Code: 400"));
        assert!(report.ends_with("Response Text:\nInvalid payload"));
        assert_eq!(transport.calls().len(), 1);
        assert!(transport.calls()[0].starts_with("POST finalize-stage-results"));
    }

    #[test]
    fn diag_config_reads_stage_and_date() {
        let env = HashMap::from([
            ("SUPABASE_PROJECT_REF", "demo"),
            ("SUPABASE_ANON_KEY", "anon"),
            ("STAGECHECK_STAGE_ID", STAGE),
            ("STAGECHECK_DATE", "2026-02-04"),
        ]);
        let cfg = DiagConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.rest.base_url, "https://demo.supabase.co");
        assert_eq!(cfg.default_stage_id.as_deref(), Some(STAGE));
        assert_eq!(cfg.report_day(at("2026-03-01T00:00:00Z")), day("2026-02-04"));
    }

    #[test]
    fn diag_config_rejects_bad_date() {
        let env = HashMap::from([
            ("SUPABASE_URL", "https://demo.supabase.co"),
            ("SUPABASE_ANON_KEY", "anon"),
            ("STAGECHECK_DATE", "04/02/2026"),
        ]);
        let err = DiagConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(err.to_string().contains("STAGECHECK_DATE"));
    }
}
