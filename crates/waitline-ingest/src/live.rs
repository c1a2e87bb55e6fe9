//! The live queue-times poller.
//!
//! A long-lived process (under `queue_times.lock`) that polls the live
//! feed every cycle, maps external ride IDs to entity codes, and appends
//! POSTED observations to `staging/live/`. It never writes the canonical
//! store — the morning merge is the only pathway from staging to fact.
//!
//! Polling is gated by park operating windows: a park is fetched only
//! between 90 minutes before its earliest open and 90 minutes after its
//! close, in the park's own zone, with the park date under the 6 AM rule.
//! A cycle with no in-window park makes no network calls at all.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use waitline_core::atomic::tmp_sibling;
use waitline_core::observation::{Observation, WaitTimeType};
use waitline_core::parkdate::park_date_in_zone;
use waitline_core::RootLayout;
use waitline_store::{csvio, DedupSet};

use crate::error::{IngestError, Result};

/// Default live feed origin.
pub const DEFAULT_BASE_URL: &str = "https://queue-times.com";

/// Live provider park ID → our park code.
pub const LIVE_PARK_IDS: &[(u32, &str)] = &[
    (6, "mk"),
    (5, "ep"),
    (7, "hs"),
    (8, "ak"),
    (16, "dl"),
    (17, "ca"),
    (64, "ia"),
    (65, "uf"),
    (334, "eu"),
    (66, "uh"),
    (274, "tdl"),
    (275, "tds"),
];

/// Minutes of slack either side of the operating window.
const WINDOW_SLACK_MINUTES: i64 = 90;

/// Upstream observations older than this trigger a staleness warning.
const STALE_AFTER_HOURS: i64 = 24;

/// Park list entry from the live feed.
#[derive(Debug, Clone, Deserialize)]
pub struct LivePark {
    /// Provider park ID.
    pub id: u32,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// IANA timezone name.
    #[serde(default)]
    pub timezone: String,
}

#[derive(Debug, Deserialize)]
struct ParkGroup {
    #[serde(default)]
    parks: Vec<LivePark>,
}

/// One ride's record in the live feed.
#[derive(Debug, Clone, Deserialize)]
pub struct LiveRide {
    /// Provider ride ID.
    pub id: u32,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Whether the ride is operating.
    #[serde(default)]
    pub is_open: bool,
    /// Posted wait in minutes.
    pub wait_time: Option<i32>,
    /// Provider-side update timestamp (UTC).
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct LiveLand {
    #[serde(default)]
    rides: Vec<LiveRide>,
}

/// The per-park wait-time document.
#[derive(Debug, Default, Deserialize)]
pub struct LiveParkDoc {
    #[serde(default)]
    lands: Vec<LiveLand>,
    #[serde(default)]
    rides: Vec<LiveRide>,
}

impl LiveParkDoc {
    /// All rides, whether nested in lands or top-level.
    #[must_use]
    pub fn all_rides(&self) -> Vec<&LiveRide> {
        self.lands
            .iter()
            .flat_map(|l| l.rides.iter())
            .chain(self.rides.iter())
            .collect()
    }
}

/// Ride-ID → entity-code mapping table.
///
/// Loaded from `config/queue_times_entity_mapping.csv` with columns
/// `entity_code, park_code, queue_times_id`. The table is the only source
/// of mappings; unmapped rides are dropped and reported.
#[derive(Debug, Default)]
pub struct EntityMapping {
    by_ride: BTreeMap<(String, u32), String>,
}

impl EntityMapping {
    /// Loads the mapping table, returning an empty mapping if absent.
    ///
    /// # Errors
    ///
    /// Returns a CSV error if the file exists but is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let mut mapping = Self::default();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "no entity mapping table; all rides will be unmapped");
            return Ok(mapping);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| IngestError::unparseable(format!("mapping table: {e}")))?;
        let headers = reader
            .headers()
            .map_err(|e| IngestError::unparseable(format!("mapping header: {e}")))?
            .clone();
        let col = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let (Some(entity_col), Some(park_col), Some(id_col)) = (
            col("entity_code"),
            col("park_code"),
            col("queue_times_id"),
        ) else {
            return Err(IngestError::unparseable(
                "mapping table missing entity_code/park_code/queue_times_id",
            ));
        };
        for record in reader.records() {
            let record = record.map_err(|e| IngestError::unparseable(e))?;
            let (Some(entity), Some(park), Some(id_raw)) =
                (record.get(entity_col), record.get(park_col), record.get(id_col))
            else {
                continue;
            };
            // IDs are stored as floats by some spreadsheet exports.
            let Ok(id) = id_raw.parse::<f64>() else {
                continue;
            };
            mapping.by_ride.insert(
                (park.to_lowercase(), id as u32),
                entity.to_uppercase(),
            );
        }
        tracing::info!(mappings = mapping.by_ride.len(), "entity mapping loaded");
        Ok(mapping)
    }

    /// Inserts one mapping (tests).
    pub fn insert(&mut self, park_code: &str, ride_id: u32, entity_code: &str) {
        self.by_ride
            .insert((park_code.to_lowercase(), ride_id), entity_code.to_uppercase());
    }

    /// Looks up the entity for a ride in a park.
    #[must_use]
    pub fn entity_for(&self, park_code: &str, ride_id: u32) -> Option<&str> {
        self.by_ride
            .get(&(park_code.to_lowercase(), ride_id))
            .map(String::as_str)
    }
}

/// Daily operating hours used by the window gate.
#[derive(Debug, Clone)]
pub struct ParkHoursRow {
    /// Minutes since local midnight for the earliest open (EMH included).
    pub open_minutes: i64,
    /// Minutes since local midnight for the close.
    pub close_minutes: i64,
}

/// Park-hours lookup keyed by `(park_code, park_date)`.
#[derive(Debug, Default)]
pub struct ParkHoursTable {
    rows: BTreeMap<(String, NaiveDate), ParkHoursRow>,
}

impl ParkHoursTable {
    /// Loads `dimension_tables/dimparkhours.csv`, returning `None` if the
    /// file is absent (the gate then treats every park as in-window).
    ///
    /// # Errors
    ///
    /// Returns a CSV error if the file exists but is malformed.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| IngestError::unparseable(format!("dimparkhours: {e}")))?;
        let headers = reader
            .headers()
            .map_err(|e| IngestError::unparseable(format!("dimparkhours header: {e}")))?
            .clone();
        let find = |candidates: &[&str]| {
            candidates.iter().find_map(|c| {
                headers.iter().position(|h| h.eq_ignore_ascii_case(c))
            })
        };
        let (Some(date_col), Some(park_col), Some(open_col), Some(close_col)) = (
            find(&["park_date", "date"]),
            find(&["park_code", "park", "code"]),
            find(&["open_time", "open", "opening_time"]),
            find(&["close_time", "close", "closing_time"]),
        ) else {
            return Err(IngestError::unparseable(
                "dimparkhours missing date/park/open/close columns",
            ));
        };
        let emh_col = find(&["emh_open", "early_entry", "emh"]);

        let mut table = Self::default();
        for record in reader.records() {
            let record = record.map_err(|e| IngestError::unparseable(e))?;
            let (Some(date_raw), Some(park), Some(open_raw), Some(close_raw)) = (
                record.get(date_col),
                record.get(park_col),
                record.get(open_col),
                record.get(close_col),
            ) else {
                continue;
            };
            let Ok(date) = date_raw.parse::<NaiveDate>() else {
                continue;
            };
            let (Some(open), Some(close)) =
                (parse_time_minutes(open_raw), parse_time_minutes(close_raw))
            else {
                continue;
            };
            let emh = emh_col
                .and_then(|i| record.get(i))
                .and_then(parse_time_minutes);
            let key = (park.to_lowercase(), date);
            let entry = table.rows.entry(key).or_insert(ParkHoursRow {
                open_minutes: open,
                close_minutes: close,
            });
            // Multiple rows per day aggregate to earliest open, latest close.
            entry.open_minutes = entry.open_minutes.min(open);
            entry.close_minutes = entry.close_minutes.max(close);
            if let Some(emh) = emh {
                entry.open_minutes = entry.open_minutes.min(emh);
            }
        }
        Ok(Some(table))
    }

    /// The hours row for a park and date, if known.
    #[must_use]
    pub fn get(&self, park_code: &str, date: NaiveDate) -> Option<&ParkHoursRow> {
        self.rows.get(&(park_code.to_lowercase(), date))
    }

    /// Whether `now` falls inside the park's scrape window.
    ///
    /// A park without an hours row is treated as in-window: missing
    /// dimensions must not silence the poller.
    #[must_use]
    pub fn is_in_window(&self, park_code: &str, tz: Tz, now: DateTime<Utc>) -> bool {
        let date = park_date_in_zone(now, tz);
        let Some(hours) = self.get(park_code, date) else {
            return true;
        };
        let midnight = date.and_hms_opt(0, 0, 0).expect("midnight");
        let base = waitline_core::parkdate::localize(midnight, tz);
        let start = base + chrono::Duration::minutes(hours.open_minutes - WINDOW_SLACK_MINUTES);
        let end = base + chrono::Duration::minutes(hours.close_minutes + WINDOW_SLACK_MINUTES);
        let now_local = now.with_timezone(&tz).fixed_offset();
        now_local >= start && now_local <= end
    }
}

/// Parses `HH:MM`(`:SS`) into minutes since midnight.
fn parse_time_minutes(raw: &str) -> Option<i64> {
    let mut parts = raw.trim().splitn(3, ':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    if (0..=23).contains(&hours) && (0..=59).contains(&minutes) {
        Some(hours * 60 + minutes)
    } else {
        None
    }
}

/// Options for the poller.
#[derive(Debug, Clone)]
pub struct LivePollerOptions {
    /// Seconds between cycles.
    pub interval: Duration,
    /// Whether the operating-window gate applies.
    pub hours_filter: bool,
    /// Feed origin (tests point this elsewhere).
    pub base_url: String,
}

impl Default for LivePollerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            hours_filter: true,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Parks fetched this cycle.
    pub parks_polled: u64,
    /// Rows staged.
    pub rows_staged: u64,
    /// Rows dropped as repeats of earlier polls.
    pub duplicates: u64,
    /// Rides without a mapping, keyed `{park}:{ride_id} {name}`.
    pub unmapped: BTreeMap<String, u64>,
    /// Records whose upstream timestamp was older than a day.
    pub stale_records: u64,
}

/// The live poller.
pub struct LivePoller {
    layout: RootLayout,
    client: reqwest::Client,
    dedup: DedupSet,
    mapping: EntityMapping,
    options: LivePollerOptions,
}

impl LivePoller {
    /// Builds a poller: its own dedup database, the mapping table, and an
    /// HTTP client that ignores system proxy variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the dedup database or mapping table cannot be
    /// opened, or the HTTP client cannot be built.
    pub fn new(layout: RootLayout, options: LivePollerOptions) -> Result<Self> {
        let dedup = DedupSet::open(&layout.queue_times_dedup_db())?;
        let mapping =
            EntityMapping::load(&layout.config_dir().join("queue_times_entity_mapping.csv"))?;
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IngestError::LiveFeed {
                message: format!("http client: {e}"),
            })?;
        Ok(Self {
            layout,
            client,
            dedup,
            mapping,
            options,
        })
    }

    /// Runs until interrupted: poll, sleep, repeat.
    ///
    /// Ctrl-C stops the loop between cycles so the caller's lock guard
    /// releases cleanly.
    ///
    /// # Errors
    ///
    /// Per-cycle failures are logged and the loop continues; only setup
    /// failures escape.
    pub async fn run(&self) -> Result<()> {
        let mut cycle = 0u64;
        loop {
            cycle += 1;
            tracing::info!(cycle, "poll cycle starting");
            match self.poll_once().await {
                Ok(report) => {
                    tracing::info!(
                        parks = report.parks_polled,
                        rows = report.rows_staged,
                        duplicates = report.duplicates,
                        unmapped = report.unmapped.len(),
                        "poll cycle complete"
                    );
                }
                Err(e) => tracing::error!(error = %e, "poll cycle failed"),
            }
            tokio::select! {
                () = tokio::time::sleep(self.options.interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted; stopping poller");
                    return Ok(());
                }
            }
        }
    }

    /// One poll cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the park list cannot be fetched; per-park
    /// failures are absorbed.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let mut report = PollReport::default();
        let now = Utc::now();

        let hours = if self.options.hours_filter {
            ParkHoursTable::load(&self.layout.dimension_tables().join("dimparkhours.csv"))?
        } else {
            None
        };

        let parks = self.fetch_parks().await?;
        let mapped: Vec<(LivePark, &'static str, Tz)> = parks
            .into_iter()
            .filter_map(|park| {
                let code = LIVE_PARK_IDS
                    .iter()
                    .find(|(id, _)| *id == park.id)
                    .map(|(_, code)| *code)?;
                let tz: Tz = park.timezone.parse().unwrap_or(chrono_tz::UTC);
                Some((park, code, tz))
            })
            .collect();

        let in_window: Vec<&(LivePark, &'static str, Tz)> = mapped
            .iter()
            .filter(|(_, code, tz)| {
                hours
                    .as_ref()
                    .map_or(true, |table| table.is_in_window(code, *tz, now))
            })
            .collect();
        if in_window.is_empty() {
            tracing::info!("no parks in scrape window; skipping cycle");
            return Ok(report);
        }

        for (park, code, tz) in in_window {
            match self.fetch_park_doc(park.id).await {
                Ok(doc) => {
                    self.stage_park(&doc, code, *tz, now, &mut report)?;
                    report.parks_polled += 1;
                }
                Err(e) => {
                    tracing::warn!(park = park.name, error = %e, "park fetch failed");
                }
            }
        }
        Ok(report)
    }

    async fn fetch_parks(&self) -> Result<Vec<LivePark>> {
        let url = format!("{}/parks.json", self.options.base_url);
        let groups: Vec<ParkGroup> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .map_err(IngestError::from)?
            .json()
            .await?;
        Ok(groups.into_iter().flat_map(|g| g.parks).collect())
    }

    async fn fetch_park_doc(&self, park_id: u32) -> Result<LiveParkDoc> {
        let url = format!("{}/parks/{park_id}/queue_times.json", self.options.base_url);
        Ok(self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .map_err(IngestError::from)?
            .json()
            .await?)
    }

    /// Transforms and stages one park document.
    fn stage_park(
        &self,
        doc: &LiveParkDoc,
        park_code: &str,
        tz: Tz,
        fetched_at: DateTime<Utc>,
        report: &mut PollReport,
    ) -> Result<()> {
        let rows = transform_park_doc(doc, park_code, tz, fetched_at, &self.mapping, report);
        if rows.is_empty() {
            return Ok(());
        }
        let mask = self.dedup.insert_new_mask(&rows)?;
        let new_rows: Vec<Observation> = rows
            .into_iter()
            .zip(&mask)
            .filter_map(|(row, new)| new.then_some(row))
            .collect();
        report.duplicates += mask.iter().filter(|new| !**new).count() as u64;
        if new_rows.is_empty() {
            return Ok(());
        }

        // Group by park date; a cycle near 6 AM can straddle two dates.
        let mut by_date: BTreeMap<NaiveDate, Vec<Observation>> = BTreeMap::new();
        for row in new_rows {
            by_date
                .entry(waitline_core::park_date(&row.observed_at))
                .or_default()
                .push(row);
        }
        for (date, rows) in by_date {
            let path = self.layout.staging_file(park_code, date);
            append_staging(&path, rows, report)?;
        }
        Ok(())
    }
}

/// Maps a park document to canonical POSTED rows.
pub fn transform_park_doc(
    doc: &LiveParkDoc,
    park_code: &str,
    tz: Tz,
    fetched_at: DateTime<Utc>,
    mapping: &EntityMapping,
    report: &mut PollReport,
) -> Vec<Observation> {
    let mut rows = Vec::new();
    for ride in doc.all_rides() {
        if !ride.is_open {
            continue;
        }
        let (Some(wait), Some(updated)) = (ride.wait_time, ride.last_updated) else {
            continue;
        };
        let Some(entity) = mapping.entity_for(park_code, ride.id) else {
            *report
                .unmapped
                .entry(format!("{park_code}:{} {}", ride.id, ride.name))
                .or_default() += 1;
            continue;
        };
        if fetched_at - updated > chrono::Duration::hours(STALE_AFTER_HOURS) {
            report.stale_records += 1;
            tracing::warn!(
                entity,
                last_updated = %updated,
                "stale upstream record (provider stopped updating)"
            );
        }
        let observed_at = updated.with_timezone(&tz).fixed_offset();
        rows.push(Observation::new(
            entity,
            observed_at,
            WaitTimeType::Posted,
            wait,
        ));
    }
    rows
}

/// Appends rows to a staging file atomically (merge, `.tmp`, rename).
fn append_staging(
    path: &Path,
    mut rows: Vec<Observation>,
    report: &mut PollReport,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(waitline_core::Error::from)?;
    }
    let staged_now = rows.len() as u64;
    if path.exists() {
        rows.extend(csvio::read_fact_file(path)?);
    }
    rows.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
    let tmp = tmp_sibling(path, "tmp");
    let result = (|| -> Result<()> {
        let file = std::fs::File::create(&tmp).map_err(waitline_core::Error::from)?;
        csvio::write_fact_rows(std::io::BufWriter::new(file), &rows)?;
        std::fs::rename(&tmp, path).map_err(waitline_core::Error::from)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
        return result;
    }
    report.rows_staged += staged_now;
    Ok(())
}
