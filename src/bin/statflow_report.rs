//! Report runner against a live REST endpoint
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin statflow_report -- summary
//! cargo run --release --bin statflow_report -- dimensions country,language,age
//! cargo run --release --bin statflow_report -- crosstab country gender
//! cargo run --release --bin statflow_report -- assigned country
//! cargo run --release --bin statflow_report -- trends 30 contributors,active_projects
//! ```
//!
//! Prints the report as JSON on stdout; logs go to stderr.
//! See `statflow::config` for environment variables. `STATFLOW_SOURCE_URL` is required.

use statflow::report::ReportService;
use statflow::snapshot::SnapshotStore;
use statflow::source::RestSource;
use statflow::{EngineConfig, FieldRole};
use std::env;
use std::sync::Arc;

const USAGE: &str = "usage: statflow_report <summary | dimensions ROLES | crosstab ROW COL | assigned ROLE | trends DAYS SERIES>";

fn parse_roles(arg: Option<&String>) -> Result<Vec<FieldRole>, Box<dyn std::error::Error>> {
    let raw = arg.ok_or(USAGE)?;
    raw.split(',')
        .map(|name| FieldRole::from_str(name.trim()).ok_or_else(|| format!("unknown role: {}", name).into()))
        .collect()
}

fn parse_role(arg: Option<&String>) -> Result<FieldRole, Box<dyn std::error::Error>> {
    let raw = arg.ok_or(USAGE)?;
    FieldRole::from_str(raw).ok_or_else(|| format!("unknown role: {}", raw).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let config = EngineConfig::from_env();
    let source = RestSource::new(
        config.require_source_url()?,
        &config.api_version,
        config.access_token.clone(),
        config.request_deadline,
    )?;

    let snapshots = Arc::new(SnapshotStore::new(
        config.open_snapshot_backend()?,
        config.snapshot_retention,
    ));
    let service = ReportService::new(Arc::new(source), config, snapshots);

    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("summary");

    let output = match command {
        "summary" => serde_json::to_string_pretty(&service.summary().await?)?,
        "dimensions" => {
            let roles = parse_roles(args.get(1))?;
            serde_json::to_string_pretty(&service.contributor_dimensions(&roles).await?)?
        }
        "crosstab" => {
            let row = parse_role(args.get(1))?;
            let column = parse_role(args.get(2))?;
            serde_json::to_string_pretty(&service.contributor_cross_tab(row, column).await?)?
        }
        "assigned" => {
            let role = parse_role(args.get(1))?;
            serde_json::to_string_pretty(&service.assigned_contributors_by(role).await?)?
        }
        "trends" => {
            let days: u32 = args.get(1).and_then(|d| d.parse().ok()).unwrap_or(30);
            let series: Vec<&str> = args
                .get(2)
                .map(|s| s.split(',').map(str::trim).collect())
                .unwrap_or_else(|| vec![statflow::report::SERIES_CONTRIBUTORS]);
            serde_json::to_string_pretty(&service.trends(&series, days).await?)?
        }
        other => return Err(format!("unknown report '{}'\n{}", other, USAGE).into()),
    };

    println!("{}", output);

    // Let a background snapshot write finish before the runtime shuts down
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
