use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use stagecheck_reports::{DiagConfig, DEFAULT_PUBLISH_SECONDS};
use stagecheck_rest::{FinalizeRequest, FunctionsClient, RestClient};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "stagecheck")]
#[command(about = "Ad-hoc diagnostics for event stages, Strava uploads and stage results")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Strava connection status of a stage's event participants
    Connections { stage_id: Option<String> },
    /// Registered participants against stage results
    Participation { stage_id: Option<String> },
    /// Connected athletes without a Strava upload today
    MissingUploads,
    /// Most recent Strava activity per athlete
    LatestActivity,
    /// Row counts and samples across upload tables
    Visibility,
    /// Connection and uploads for specific users on one day
    UserDebug {
        #[arg(required = true)]
        user_ids: Vec<String>,
        /// Day to inspect (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// List event stages
    Stages,
    /// Column names and a sample row of event_stages
    InspectStages,
    /// Dump event_leaderboard rows
    Leaderboard,
    /// Ten most recent workout metrics
    Metrics,
    /// Call fetch-stage-results for a stage
    FetchResults { stage_id: Option<String> },
    /// Post one official result to finalize-stage-results
    PublishResults {
        stage_id: Option<String>,
        result_id: Option<String>,
        #[arg(long, default_value_t = DEFAULT_PUBLISH_SECONDS)]
        seconds: u64,
    },
}

const STAGE_ID: &str = "Stage ID";
const RESULT_ID: &str = "Result ID";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Take the identifier from the argument, then `fallback`, then `input`.
/// An empty answer yields `None`; anything else must be a UUID.
fn resolve_identifier(
    arg: Option<String>,
    fallback: Option<&str>,
    label: &str,
    input: &mut impl BufRead,
) -> Result<Option<String>> {
    let raw = match arg.or_else(|| fallback.map(str::to_string)) {
        Some(value) => value,
        None => {
            print!("Enter {label}: ");
            io::stdout().flush().context("flushing prompt")?;
            let mut line = String::new();
            input
                .read_line(&mut line)
                .with_context(|| format!("reading {label} from stdin"))?;
            line
        }
    };

    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let id = Uuid::parse_str(raw).with_context(|| format!("{label} '{raw}' is not a valid UUID"))?;
    Ok(Some(id.to_string()))
}

fn require_identifier(
    arg: Option<String>,
    fallback: Option<&str>,
    label: &str,
) -> Result<Option<String>> {
    let resolved = resolve_identifier(arg, fallback, label, &mut io::stdin().lock())?;
    if resolved.is_none() {
        println!("No {label} provided. Exiting.");
    }
    Ok(resolved)
}

fn rest_client(config: &DiagConfig) -> Result<RestClient> {
    RestClient::new(config.rest.clone()).context("building REST client")
}

fn functions_client(config: &DiagConfig) -> Result<FunctionsClient> {
    FunctionsClient::new(config.rest.clone()).context("building functions client")
}

async fn run(command: Commands, config: &DiagConfig) -> Result<Option<String>> {
    let now = Utc::now();
    let default_stage = config.default_stage_id.as_deref();

    let report = match command {
        Commands::Connections { stage_id } => {
            let Some(stage_id) = require_identifier(stage_id, default_stage, STAGE_ID)? else {
                return Ok(None);
            };
            stagecheck_reports::connections_report(&rest_client(config)?, &stage_id).await?
        }
        Commands::Participation { stage_id } => {
            let Some(stage_id) = require_identifier(stage_id, default_stage, STAGE_ID)? else {
                return Ok(None);
            };
            stagecheck_reports::participation_report(&rest_client(config)?, &stage_id, now).await?
        }
        Commands::MissingUploads => {
            stagecheck_reports::missing_uploads_report(&rest_client(config)?, config.report_day(now))
                .await?
        }
        Commands::LatestActivity => {
            stagecheck_reports::latest_activity_report(&rest_client(config)?, now).await?
        }
        Commands::Visibility => {
            stagecheck_reports::visibility_report(&rest_client(config)?, config.report_day(now))
                .await?
        }
        Commands::UserDebug { user_ids, date } => {
            let user_ids = user_ids
                .iter()
                .map(|raw| {
                    Uuid::parse_str(raw.trim())
                        .map(|id| id.to_string())
                        .with_context(|| format!("user id '{raw}' is not a valid UUID"))
                })
                .collect::<Result<Vec<_>>>()?;
            let day = date.unwrap_or_else(|| config.report_day(now));
            stagecheck_reports::user_debug_report(&rest_client(config)?, &user_ids, day).await?
        }
        Commands::Stages => stagecheck_reports::stages_report(&rest_client(config)?).await?,
        Commands::InspectStages => {
            stagecheck_reports::inspect_stages_report(&rest_client(config)?).await?
        }
        Commands::Leaderboard => {
            stagecheck_reports::leaderboard_report(&rest_client(config)?).await?
        }
        Commands::Metrics => stagecheck_reports::metrics_report(&rest_client(config)?).await?,
        Commands::FetchResults { stage_id } => {
            let Some(stage_id) = require_identifier(stage_id, default_stage, STAGE_ID)? else {
                return Ok(None);
            };
            stagecheck_reports::fetch_results_report(&functions_client(config)?, &stage_id).await?
        }
        Commands::PublishResults {
            stage_id,
            result_id,
            seconds,
        } => {
            let Some(stage_id) = require_identifier(stage_id, default_stage, STAGE_ID)? else {
                return Ok(None);
            };
            let Some(result_id) = require_identifier(result_id, None, RESULT_ID)? else {
                return Ok(None);
            };
            let request = FinalizeRequest::single(stage_id, result_id, seconds);
            stagecheck_reports::publish_results_report(&functions_client(config)?, &request).await?
        }
    };
    Ok(Some(report))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    debug!(command = ?cli.command, "starting");

    let config = DiagConfig::from_env()?;
    if let Some(report) = run(cli.command, &config).await? {
        println!("{report}");
    }
    Ok(())
}
