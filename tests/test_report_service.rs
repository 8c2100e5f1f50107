//! Integration tests for the report service
//!
//! Drives the full pipeline (discovery → fetch/join → aggregation → cache →
//! snapshots) over the seeded in-memory source.
//!
//! Key behaviors tested:
//! - Joined reports agree whether the source traverses relationships or not
//! - Stale cache hits are served immediately and refreshed in the background
//! - Summaries feed the snapshot log, trends read it back
//! - Deadlines produce partial results instead of errors

#[cfg(test)]
mod report_service_tests {
    use statflow::cache::Clock;
    use statflow::report::{ReportService, SERIES_ACTIVE_PROJECTS, SERIES_CONTRIBUTORS};
    use statflow::snapshot::{JsonFileBackend, SnapshotStore};
    use statflow::source::{demo_dataset, MemorySource};
    use statflow::{EngineConfig, FieldRole};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Arc<SnapshotStore> {
        Arc::new(SnapshotStore::new(
            Box::new(JsonFileBackend::new(dir.path().join("snapshots.json"))),
            365,
        ))
    }

    fn service(source: MemorySource, dir: &TempDir) -> ReportService {
        ReportService::new(Arc::new(source), EngineConfig::default(), store(dir))
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn test_assigned_contributors_same_with_and_without_traversal() {
        let dir = TempDir::new().unwrap();
        let joining = service(demo_dataset(21, 400).with_page_size(60), &dir);
        let rejecting = service(demo_dataset(21, 400).with_page_size(60).without_relationships(), &dir);

        let tier_one = joining.assigned_contributors_by(FieldRole::Country).await.unwrap();
        let tier_two = rejecting.assigned_contributors_by(FieldRole::Country).await.unwrap();

        assert!(!tier_one.data.partial);
        assert!(!tier_two.data.partial);
        assert!(!tier_one.data.dimensions["country"].is_empty());
        assert_eq!(tier_one.data.dimensions, tier_two.data.dimensions);
        assert_eq!(tier_one.data.records_scanned, tier_two.data.records_scanned);
    }

    #[tokio::test]
    async fn test_assigned_contributors_never_exceed_assignments() {
        let dir = TempDir::new().unwrap();
        let service = service(demo_dataset(9, 200), &dir);

        let report = service.assigned_contributors_by(FieldRole::Gender).await.unwrap();
        let distinct: u64 = report.data.dimensions["gender"].iter().map(|k| k.count).sum();

        // Many assignments per contributor, each contributor counted once
        assert!(distinct <= 200);
        assert!(distinct < report.data.records_scanned as u64);
    }

    #[tokio::test]
    async fn test_missing_country_lands_in_unknown() {
        let dir = TempDir::new().unwrap();
        let service = service(demo_dataset(4, 400), &dir);

        let report = service.contributor_dimensions(&[FieldRole::Country]).await.unwrap();
        let countries = &report.data.dimensions["country"];

        assert!(countries.iter().any(|k| k.key == "Unknown"));
        assert_eq!(countries.iter().map(|k| k.count).sum::<u64>(), 400);
        assert_eq!(report.data.records_scanned, 400);
    }

    #[tokio::test]
    async fn test_age_comes_from_birthdate() {
        let dir = TempDir::new().unwrap();
        let service = service(demo_dataset(4, 300), &dir);

        let report = service.contributor_dimensions(&[FieldRole::Age]).await.unwrap();
        let brackets: Vec<&str> = report.data.dimensions["age"].iter().map(|k| k.key.as_str()).collect();

        assert!(!brackets.is_empty());
        for bracket in brackets {
            assert!(
                ["Under 18", "18-24", "25-34", "35-44", "45-54", "55-64", "65+"].contains(&bracket),
                "unexpected bracket {}",
                bracket
            );
        }
    }

    #[tokio::test]
    async fn test_cross_tab_rows_add_up() {
        let dir = TempDir::new().unwrap();
        let service = service(demo_dataset(13, 250), &dir);

        let response = service
            .contributor_cross_tab(FieldRole::Country, FieldRole::Gender)
            .await
            .unwrap();
        let tab = &response.data;

        assert_eq!(tab.row_dimension, "country");
        assert_eq!(tab.column_dimension, "gender");
        assert_eq!(tab.rows.iter().map(|r| r.total).sum::<u64>(), tab.total);
        assert_eq!(tab.total, 250);

        let json = serde_json::to_value(&response).unwrap();
        assert!(json["rows"][0]["rowKey"].is_string());
        assert!(json["columns"].is_array());
        assert_eq!(json["cached"], false);
    }

    #[tokio::test]
    async fn test_unavailable_cross_tab_is_empty() {
        let dir = TempDir::new().unwrap();
        let service = service(demo_dataset(13, 50), &dir);

        let response = service
            .contributor_cross_tab(FieldRole::Country, FieldRole::Type)
            .await
            .unwrap();

        assert!(response.data.rows.is_empty());
        assert_eq!(response.data.total, 0);
    }

    #[tokio::test]
    async fn test_summary_feeds_trends() {
        let dir = TempDir::new().unwrap();
        let service = service(demo_dataset(17, 120), &dir);

        let summary = service.summary().await.unwrap();
        assert_eq!(summary.data.contributors, 120);
        let active_assignments = summary.data.active_assignments.unwrap();
        assert!(active_assignments >= summary.data.unique_assigned_contributors.unwrap());
        assert!(!summary.data.partial);

        let snapshots = service.snapshots().clone();
        wait_until(|| snapshots.latest().is_some()).await;

        let trends = service
            .trends(&[SERIES_CONTRIBUTORS, SERIES_ACTIVE_PROJECTS], 7)
            .await
            .unwrap();
        let contributors = &trends.trends[SERIES_CONTRIBUTORS];
        assert_eq!(contributors.len(), 1);
        assert_eq!(contributors[0].count, 120);
        assert_eq!(Some(trends.trends[SERIES_ACTIVE_PROJECTS][0].count), summary.data.active_projects);

        let json = serde_json::to_value(&trends).unwrap();
        assert_eq!(json["trends"]["contributors"][0]["count"], 120);
    }

    #[tokio::test]
    async fn test_stale_hit_is_served_then_refreshed() {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(demo_dataset(3, 80));
        let now = Arc::new(AtomicU64::new(0));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || handle.load(Ordering::SeqCst));

        let config = EngineConfig {
            cache_ttl: Duration::from_millis(1_000),
            ..EngineConfig::default()
        };
        let service = ReportService::with_clock(memory.clone(), config, store(&dir), clock);

        let first = service.summary().await.unwrap();
        assert!(!first.cached);
        let calls_after_first = memory.query_calls();

        now.store(850, Ordering::SeqCst);
        let stale = service.summary().await.unwrap();
        assert!(stale.cached);
        assert!(stale.stale);
        assert_eq!(stale.data, first.data);

        wait_until(|| !service.is_refreshing("summary")).await;
        assert!(memory.query_calls() > calls_after_first);

        let refreshed = service.summary().await.unwrap();
        assert!(refreshed.cached);
        assert!(!refreshed.stale);
        assert_eq!(refreshed.age_seconds, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_partial_report() {
        let dir = TempDir::new().unwrap();
        let source = demo_dataset(5, 2_000)
            .with_page_size(100)
            .with_latency(Duration::from_millis(30));
        let config = EngineConfig {
            request_deadline: Duration::from_millis(50),
            max_pages: 1_000,
            ..EngineConfig::default()
        };
        let service = ReportService::new(Arc::new(source), config, store(&dir));

        let report = service.contributor_dimensions(&[FieldRole::Country]).await.unwrap();

        assert!(report.data.partial);
        assert!(report.data.records_scanned <= 200);
        assert!(report.data.records_scanned > 0);
    }
}
