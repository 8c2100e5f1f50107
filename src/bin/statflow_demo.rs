//! Demo runner over a seeded in-memory dataset
//!
//! Exercises every report path without a live endpoint: dimension reports, a
//! cross-tab, the joined "assigned contributors" report (once with server-side
//! traversal, once with relationships disabled), the summary with its
//! snapshot, trends and a cache hit.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin statflow_demo -- [--contributors N] [--seed S] [--no-relationships]
//! ```

use statflow::report::{ReportService, SERIES_ACTIVE_ASSIGNMENTS, SERIES_CONTRIBUTORS};
use statflow::snapshot::SnapshotStore;
use statflow::source::demo_dataset;
use statflow::{EngineConfig, FieldRole};
use std::env;
use std::sync::Arc;
use std::time::Duration;

fn arg_value(args: &[String], flag: &str) -> Option<u64> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1))
        .and_then(|v| v.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    let contributors = arg_value(&args, "--contributors").unwrap_or(2_000) as usize;
    let seed = arg_value(&args, "--seed").unwrap_or(42);
    let relationships = !args.iter().any(|a| a == "--no-relationships");

    let mut source = demo_dataset(seed, contributors)
        .with_page_size(250)
        .with_latency(Duration::from_millis(5));
    if !relationships {
        source = source.without_relationships();
    }

    let config = EngineConfig::from_env();
    let snapshots = Arc::new(SnapshotStore::new(
        config.open_snapshot_backend()?,
        config.snapshot_retention,
    ));

    log::info!("🚀 statflow demo: {} contributors, seed {}", contributors, seed);
    let service = ReportService::new(Arc::new(source), config, snapshots);

    let dimensions = service
        .contributor_dimensions(&[
            FieldRole::Country,
            FieldRole::Language,
            FieldRole::Age,
            FieldRole::Gender,
            FieldRole::Education,
            FieldRole::Source,
        ])
        .await?;
    println!("{}", serde_json::to_string_pretty(&dimensions)?);

    let cross_tab = service
        .contributor_cross_tab(FieldRole::Country, FieldRole::Gender)
        .await?;
    println!("{}", serde_json::to_string_pretty(&cross_tab)?);

    let assigned = service.assigned_contributors_by(FieldRole::Country).await?;
    println!("{}", serde_json::to_string_pretty(&assigned)?);

    let summary = service.summary().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let again = service.summary().await?;
    log::info!("🗄️  Second summary request cached: {}", again.cached);

    // Give the background snapshot write a moment
    tokio::time::sleep(Duration::from_millis(200)).await;

    let trends = service
        .trends(&[SERIES_CONTRIBUTORS, SERIES_ACTIVE_ASSIGNMENTS], 30)
        .await?;
    println!("{}", serde_json::to_string_pretty(&trends)?);

    Ok(())
}
