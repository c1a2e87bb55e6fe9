//! End-to-end ingest scenarios over the public API.

use chrono::{NaiveDate, TimeZone, Utc};
use tempfile::TempDir;

use waitline_core::observation::{parse_observed_at, Observation, WaitTimeType};
use waitline_core::RootLayout;
use waitline_ingest::merge::merge_staging_for_date;
use waitline_ingest::{IngestOptions, Ingestor, MemorySourceStore};
use waitline_store::{csvio, DedupSet, EntityIndex};

struct Pipeline {
    _dir: TempDir,
    layout: RootLayout,
    dedup: DedupSet,
    index: EntityIndex,
    source: MemorySourceStore,
}

fn pipeline() -> Pipeline {
    let dir = TempDir::new().expect("tempdir");
    let layout = RootLayout::new(dir.path());
    let dedup = DedupSet::open(&layout.dedup_db()).expect("dedup");
    let index = EntityIndex::open(&layout.entity_index_db()).expect("index");
    Pipeline {
        _dir: dir,
        layout,
        dedup,
        index,
        source: MemorySourceStore::new(),
    }
}

fn options() -> IngestOptions {
    IngestOptions {
        properties: vec!["wdw".into()],
        chunksize: 10_000,
        ..IngestOptions::default()
    }
}

#[tokio::test]
async fn standby_file_produces_partition_and_index() {
    let p = pipeline();
    let modified = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    p.source.put(
        "export/wait_times/wdw/jan.csv",
        modified,
        "entity_code,observed_at,submitted_posted_time,submitted_actual_time\n\
         MK101,2024-01-15T10:30:00,35,40\n",
    );

    let ingestor = Ingestor::new(&p.source, &p.layout, &p.dedup, &p.index);
    let report = ingestor.run(&options()).await.expect("run");
    assert_eq!(report.files_processed, 1);

    let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    let rows = csvio::read_fact_file(&p.layout.fact_file("mk", date)).expect("read");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].observed_at_string(), "2024-01-15T10:30:00-05:00");
    assert_eq!(rows[0].wait_time_type, WaitTimeType::Posted);
    assert_eq!(rows[0].wait_time_minutes, 35);
    assert_eq!(rows[1].wait_time_type, WaitTimeType::Actual);
    assert_eq!(rows[1].wait_time_minutes, 40);

    let record = p.index.get("MK101").expect("get").expect("present");
    assert_eq!(record.posted_count, 1);
    assert_eq!(record.actual_count, 1);
    assert_eq!(record.latest_park_date, "2024-01-15");
}

#[tokio::test]
async fn legacy_fastpass_sold_out_emits_sentinel() {
    let p = pipeline();
    let modified = Utc.with_ymd_and_hms(2016, 7, 1, 0, 0, 0).unwrap();
    // Headerless legacy layout; 8500 in the return-hour column is sold out.
    p.source.put(
        "export/fastpass_times/wdw/fp_2016.csv",
        modified,
        "c0,c1,c2,c3,c4,c5,c6,c7\n\
         MK101,10,6,2016,9,15,8500,0\n",
    );

    let ingestor = Ingestor::new(&p.source, &p.layout, &p.dedup, &p.index);
    let report = ingestor.run(&options()).await.expect("run");
    assert_eq!(report.files_processed, 1);
    assert_eq!(report.write.priority_written, 1);

    let date = NaiveDate::from_ymd_opt(2016, 6, 10).unwrap();
    let rows = csvio::read_fact_file(&p.layout.fact_file("mk", date)).expect("read");
    assert_eq!(rows[0].wait_time_type, WaitTimeType::Priority);
    assert_eq!(rows[0].wait_time_minutes, 8888);
}

#[tokio::test]
async fn six_am_rule_routes_early_morning_to_previous_date() {
    let p = pipeline();
    let modified = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    p.source.put(
        "export/wait_times/wdw/march.csv",
        modified,
        "entity_code,observed_at,submitted_posted_time,submitted_actual_time\n\
         EP09,2024-03-11T03:15:00,,25\n",
    );

    let ingestor = Ingestor::new(&p.source, &p.layout, &p.dedup, &p.index);
    ingestor.run(&options()).await.expect("run");

    let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
    let path = p.layout.fact_file("ep", date);
    assert!(path.exists(), "expected {}", path.display());
    let rows = csvio::read_fact_file(&path).expect("read");
    assert_eq!(rows[0].entity_code, "EP09");
}

#[tokio::test]
async fn reingest_is_a_no_op() {
    let p = pipeline();
    let modified = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    p.source.put(
        "export/wait_times/wdw/jan.csv",
        modified,
        "entity_code,observed_at,submitted_posted_time,submitted_actual_time\n\
         MK101,2024-01-15T10:30:00,35,40\n",
    );

    let ingestor = Ingestor::new(&p.source, &p.layout, &p.dedup, &p.index);
    ingestor.run(&options()).await.expect("first");
    let dedup_before = p.dedup.len().expect("len");
    let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    let facts_before = csvio::read_fact_file(&p.layout.fact_file("mk", date)).expect("read");

    let second = ingestor.run(&options()).await.expect("second");
    assert_eq!(second.files_processed, 0);
    assert_eq!(second.files_skipped, 1);

    assert_eq!(p.dedup.len().expect("len"), dedup_before);
    let facts_after = csvio::read_fact_file(&p.layout.fact_file("mk", date)).expect("read");
    assert_eq!(facts_after, facts_before);
}

#[tokio::test]
async fn morning_merge_unions_and_deletes_staging() {
    let p = pipeline();
    let date = NaiveDate::from_ymd_opt(2026, 1, 26).unwrap();

    // Existing canonical rows arrive via a source file.
    let modified = Utc.with_ymd_and_hms(2026, 1, 27, 0, 0, 0).unwrap();
    p.source.put(
        "export/wait_times/wdw/live_day.csv",
        modified,
        "entity_code,observed_at,submitted_posted_time,submitted_actual_time\n\
         MK101,2026-01-26T09:00:00,10,\n\
         MK101,2026-01-26T09:05:00,15,\n",
    );
    let ingestor = Ingestor::new(&p.source, &p.layout, &p.dedup, &p.index);
    ingestor.run(&options()).await.expect("seed");

    // Staging: five new rows plus the two already canonical.
    let mut staged: Vec<Observation> = (0..5)
        .map(|i| {
            Observation::new(
                "MK101",
                parse_observed_at(&format!("2026-01-26T10:{:02}:00-05:00", i * 5)).unwrap(),
                WaitTimeType::Posted,
                20 + i,
            )
        })
        .collect();
    staged.push(Observation::new(
        "MK101",
        parse_observed_at("2026-01-26T09:00:00-05:00").unwrap(),
        WaitTimeType::Posted,
        10,
    ));
    staged.push(Observation::new(
        "MK101",
        parse_observed_at("2026-01-26T09:05:00-05:00").unwrap(),
        WaitTimeType::Posted,
        15,
    ));
    let staging_path = p.layout.staging_file("mk", date);
    std::fs::create_dir_all(staging_path.parent().unwrap()).expect("mkdir");
    let file = std::fs::File::create(&staging_path).expect("create");
    csvio::write_fact_rows(file, &staged).expect("write");

    let report = merge_staging_for_date(&p.layout, &p.dedup, &p.index, date).expect("merge");
    assert_eq!(report.files_merged, 1);
    assert_eq!(report.write.total_written(), 5);
    assert_eq!(report.write.duplicates, 2);

    let rows = csvio::read_fact_file(&p.layout.fact_file("mk", date)).expect("read");
    assert_eq!(rows.len(), 7);
    assert!(!staging_path.exists());

    // Sorted by observed_at end to end.
    let mut sorted = rows.clone();
    sorted.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
    assert_eq!(rows, sorted);
}

#[tokio::test]
async fn index_rebuild_reproduces_incremental_counts() {
    let p = pipeline();
    let modified = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    p.source.put(
        "export/wait_times/wdw/jan.csv",
        modified,
        "entity_code,observed_at,submitted_posted_time,submitted_actual_time\n\
         MK101,2024-01-15T10:30:00,35,40\n\
         MK101,2024-01-15T11:30:00,45,\n\
         MK102,2024-01-15T10:00:00,20,\n",
    );

    let ingestor = Ingestor::new(&p.source, &p.layout, &p.dedup, &p.index);
    ingestor.run(&options()).await.expect("run");

    let incremental = p.index.all().expect("all");
    p.index.rebuild(&p.layout).expect("rebuild");
    let rebuilt = p.index.all().expect("all");

    assert_eq!(incremental.len(), rebuilt.len());
    for (a, b) in incremental.iter().zip(&rebuilt) {
        assert_eq!(a.entity_code, b.entity_code);
        assert_eq!(a.row_count, b.row_count);
        assert_eq!(a.actual_count, b.actual_count);
        assert_eq!(a.posted_count, b.posted_count);
        assert_eq!(a.priority_count, b.priority_count);
        assert_eq!(a.latest_park_date, b.latest_park_date);
    }
}
