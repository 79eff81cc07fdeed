use anyhow::Result;
use chrono::NaiveDate;
use finops_costs::config::StoreNames;
use finops_costs::error::{CostError, ProviderError};
use finops_costs::pipeline::{run_ingestion, IngestRequest, IngestSummary};
use finops_costs::query::{CostFilter, CostQuery};
use finops_costs::storage::CsvStore;
use finops_costs::types::{CanonicalRecord, CostSource, Provider, RawDate, RawRecord};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct StubSource {
    provider: Provider,
    rows: Vec<RawRecord>,
}

#[async_trait::async_trait]
impl CostSource for StubSource {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn fetch(&self, _start: NaiveDate, _end: NaiveDate) -> Result<Vec<RawRecord>, ProviderError> {
        Ok(self.rows.clone())
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
}

fn stubs(aws_rows: Vec<RawRecord>) -> Vec<Arc<dyn CostSource>> {
    vec![
        Arc::new(StubSource { provider: Provider::Aws, rows: aws_rows }),
        Arc::new(StubSource { provider: Provider::Azure, rows: Vec::new() }),
        Arc::new(StubSource { provider: Provider::Gcp, rows: Vec::new() }),
    ]
}

#[tokio::test]
async fn test_ingestion_appends_after_existing_rows() -> Result<()> {
    let temp_dir = tempdir()?;
    let store = Arc::new(CsvStore::new(temp_dir.path()));
    let names = StoreNames::default();

    // A previous run left one row behind
    store.save(&[CanonicalRecord::new(day(1), "S3", 0.5)], "aws_2025")?;

    let aws_rows = vec![
        RawRecord {
            date: RawDate::Text("2025-01-01".into()),
            service: Some("Amazon Elastic Compute Cloud - Compute".into()),
            cost_usd: Some(12.5),
        },
        RawRecord {
            date: RawDate::Text("2025-01-02T00:00:00Z".into()),
            service: Some("Amazon Simple Storage Service".into()),
            cost_usd: Some(1.25),
        },
        RawRecord {
            date: RawDate::Date(day(3)),
            service: None,
            cost_usd: Some(-0.75),
        },
    ];

    let summary = run_ingestion(
        stubs(aws_rows),
        store.clone(),
        &names,
        &IngestRequest::new(day(1), day(3)),
        Duration::from_secs(5),
    )
    .await?;
    assert_eq!(summary, IngestSummary { status: "ok".into(), count: 3 });

    let content = fs::read_to_string(store.path_for("aws_2025"))?;
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(
        lines,
        vec![
            "date,service,cost_usd",
            "2025-01-01,S3,0.5",
            "2025-01-01,Amazon Elastic Compute Cloud - Compute,12.5",
            "2025-01-02,Amazon Simple Storage Service,1.25",
            "2025-01-03,,-0.75",
        ]
    );
    assert!(!store.exists("azure_2025"));
    assert!(!store.exists("gcp_2025"));
    Ok(())
}

#[tokio::test]
async fn test_ingested_rows_are_queryable() -> Result<()> {
    let temp_dir = tempdir()?;
    let store = Arc::new(CsvStore::new(temp_dir.path()));
    let names = StoreNames::default();

    let gcp: Arc<dyn CostSource> = Arc::new(StubSource {
        provider: Provider::Gcp,
        rows: vec![RawRecord {
            date: RawDate::Text("2025-01-02".into()),
            service: Some("BigQuery".into()),
            cost_usd: Some(4.0),
        }],
    });
    let azure: Arc<dyn CostSource> = Arc::new(StubSource {
        provider: Provider::Azure,
        rows: vec![RawRecord {
            date: RawDate::Numeric(20250101),
            service: Some("Storage".into()),
            cost_usd: Some(2.0),
        }],
    });

    run_ingestion(
        vec![gcp, azure],
        store.clone(),
        &names,
        &IngestRequest::new(day(1), day(2)),
        Duration::from_secs(5),
    )
    .await?;

    let query = CostQuery::new(store, names);
    let rows = query.fetch_all_costs(&CostFilter::default())?;
    let tagged: Vec<(Provider, NaiveDate)> = rows.iter().map(|r| (r.provider, r.row.date)).collect();
    assert_eq!(tagged, vec![(Provider::Azure, day(1)), (Provider::Gcp, day(2))]);

    let summary = query.summarize(&CostFilter::default())?;
    assert_eq!(summary.total_cost_usd, 6.0);
    assert_eq!(summary.service_count, 2);
    assert_eq!(summary.month_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_header_mismatch_is_reported_not_written() -> Result<()> {
    let temp_dir = tempdir()?;
    let store = Arc::new(CsvStore::new(temp_dir.path()));
    let path = store.path_for("aws_2025");
    fs::write(&path, "date,service,cost_usd,region\n2025-01-01,EC2,1.0,us-east-1\n")?;

    let rows = vec![RawRecord {
        date: RawDate::Text("2025-01-02".into()),
        service: Some("EC2".into()),
        cost_usd: Some(2.0),
    }];
    let err = run_ingestion(
        stubs(rows),
        store.clone(),
        &StoreNames::default(),
        &IngestRequest::new(day(1), day(3)),
        Duration::from_secs(5),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CostError::DataIntegrity { .. }));
    let content = fs::read_to_string(&path)?;
    assert_eq!(content.lines().count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_bad_gcp_header_leaves_aws_store_unchanged() -> Result<()> {
    let temp_dir = tempdir()?;
    let store = Arc::new(CsvStore::new(temp_dir.path()));
    store.save(&[CanonicalRecord::new(day(1), "S3", 0.5)], "aws_2025")?;
    let aws_before = fs::read_to_string(store.path_for("aws_2025"))?;
    fs::write(store.path_for("gcp_2025"), "date,service,cost_usd,region\n")?;

    let text = |date: &str, service: &str| RawRecord {
        date: RawDate::Text(date.into()),
        service: Some(service.into()),
        cost_usd: Some(1.0),
    };
    let sources: Vec<Arc<dyn CostSource>> = vec![
        Arc::new(StubSource { provider: Provider::Aws, rows: vec![text("2025-01-02", "EC2")] }),
        Arc::new(StubSource { provider: Provider::Gcp, rows: vec![text("2025-01-02", "BigQuery")] }),
    ];
    let err = run_ingestion(
        sources,
        store.clone(),
        &StoreNames::default(),
        &IngestRequest::new(day(1), day(3)),
        Duration::from_secs(5),
    )
    .await
    .unwrap_err();

    match err {
        CostError::DataIntegrity { store: name, .. } => assert_eq!(name, "gcp_2025"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fs::read_to_string(store.path_for("aws_2025"))?, aws_before);
    Ok(())
}
