use std::error::Error;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use duckdb::{params, types::ValueRef, Connection};
use itertools::izip;
use jiff::civil::{Date, DateTime};
use jiff::tz::TimeZone;
use jiff::{Timestamp, ToSpan, Zoned};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::db::netznoe::lib_smartmeter::{ConsumptionInfo, SmartMeterClient};

/// DuckDB file holding the imported rows of one metering point.
pub const DB_FILENAME: &str = "consumption_data.db";

/// One imported consumption interval.
#[derive(Debug, PartialEq)]
pub struct Row {
    pub timestamp: DateTime,
    pub metered: Option<f64>,
    pub estimated: Option<f64>,
    pub metered_peak: Option<f64>,
    pub estimated_peak: Option<f64>,
    pub mean_profile: Option<f64>,
}

/// One day file as written by the fetcher.  The value sequences run parallel
/// to `peakDemandTimes`: entry i of each describes the same sub-daily
/// interval.  Extra keys the portal returns are kept in the file but play no
/// role here.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayRecord {
    pub peak_demand_times: Vec<DateTime>,
    pub metered_values: Vec<Option<f64>>,
    pub estimated_values: Vec<Option<f64>>,
    pub metered_peak_demands: Vec<Option<f64>>,
    pub estimated_peak_demands: Vec<Option<f64>>,
    pub mean_profile: Option<Vec<Option<f64>>>,
}

impl DayRecord {
    /// Zip the parallel sequences into per timestamp rows.  Days without a
    /// mean profile get NULL mean_profile columns.
    pub fn rows(&self) -> Result<Vec<Row>, String> {
        let n = self.peak_demand_times.len();
        check_len("meteredValues", self.metered_values.len(), n)?;
        check_len("estimatedValues", self.estimated_values.len(), n)?;
        check_len("meteredPeakDemands", self.metered_peak_demands.len(), n)?;
        check_len("estimatedPeakDemands", self.estimated_peak_demands.len(), n)?;
        let mean_profile = match &self.mean_profile {
            Some(values) => {
                check_len("meanProfile", values.len(), n)?;
                values.clone()
            }
            None => vec![None; n],
        };

        Ok(izip!(
            &self.peak_demand_times,
            &self.metered_values,
            &self.estimated_values,
            &self.metered_peak_demands,
            &self.estimated_peak_demands,
            &mean_profile
        )
        .map(
            |(timestamp, metered, estimated, metered_peak, estimated_peak, mean_profile)| Row {
                timestamp: *timestamp,
                metered: *metered,
                estimated: *estimated,
                metered_peak: *metered_peak,
                estimated_peak: *estimated_peak,
                mean_profile: *mean_profile,
            },
        )
        .collect())
    }
}

fn check_len(field: &str, len: usize, expected: usize) -> Result<(), String> {
    if len != expected {
        return Err(format!(
            "{} has {} values, peakDemandTimes has {}",
            field, len, expected
        ));
    }
    Ok(())
}

/// Day files and per meter DuckDBs under one storage root, laid out as
/// `<base_dir>/<account_id>/<metering_point_id>/<date>.json`.
#[derive(Clone)]
pub struct ConsumptionArchive {
    pub base_dir: String,
}

impl ConsumptionArchive {
    /// Directory with the day files of one metering point.
    pub fn meter_dir(&self, info: &ConsumptionInfo) -> String {
        self.base_dir.to_owned() + "/" + &info.account_id + "/" + &info.metering_point_id
    }

    /// Return the json filename for the day.  Does not check if the file exists.
    pub fn filename(&self, info: &ConsumptionInfo, date: &Date) -> String {
        self.meter_dir(info) + "/" + &date.to_string() + ".json"
    }

    /// Path of the DuckDB file of one metering point directory.
    pub fn duckdb_path(&self, meter_dir: &Path) -> PathBuf {
        meter_dir.join(DB_FILENAME)
    }

    /// Look for missing days between `start_date` and today, oldest first,
    /// and fetch them.  A day whose file already exists is never fetched
    /// again; a day the portal has no data for yet is skipped and picked up
    /// by a later run.  Returns the number of files written.
    pub fn download_missing_days(
        &self,
        client: &SmartMeterClient,
        info: &ConsumptionInfo,
        start_date: Date,
    ) -> Result<u32, Box<dyn Error>> {
        fs::create_dir_all(self.meter_dir(info))?;
        let mut downloaded = 0;
        for day in sync_days(start_date, Zoned::now().date()) {
            let fname = self.filename(info, &day);
            if Path::new(&fname).exists() {
                debug!(
                    "consumption records for {} and {} already exist",
                    info.metering_point_id, day
                );
                continue;
            }
            match client.consumption_record_for_day(&info.metering_point_id, day, true)? {
                Some(record) => {
                    write_day_file(Path::new(&fname), &record)?;
                    info!("  downloaded file for {}", day);
                    downloaded += 1;
                }
                None => error!(
                    "consumption records for {} and {} missing data",
                    info.metering_point_id, day
                ),
            }
        }
        Ok(downloaded)
    }

    /// Read one day file.
    pub fn read_file(&self, path: &Path) -> Result<DayRecord, Box<dyn Error>> {
        let file = File::open(path)?;
        let record: DayRecord = serde_json::from_reader(file)
            .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
        Ok(record)
    }

    /// Create the consumption_data table and its unique timestamp constraint
    /// if the store is brand new.  An existing store is left untouched.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<(), Box<dyn Error>> {
        conn.execute_batch(
            r#"
CREATE SEQUENCE IF NOT EXISTS consumption_data_id_seq;
CREATE TABLE IF NOT EXISTS consumption_data (
    id INTEGER PRIMARY KEY DEFAULT nextval('consumption_data_id_seq'),
    "timestamp" TIMESTAMP NOT NULL UNIQUE,
    metered DOUBLE,
    estimated DOUBLE,
    metered_peak DOUBLE,
    estimated_peak DOUBLE,
    mean_profile DOUBLE
);
            "#,
        )?;
        Ok(())
    }

    /// Merge every day file of one metering point directory into its DuckDB,
    /// in ascending date order.  Entries that are not `<date>.json` files
    /// are housekeeping and ignored.  Returns the number of newly inserted
    /// rows; timestamps already in the store are left untouched.
    pub fn update_duckdb(&self, meter_dir: &Path) -> Result<usize, Box<dyn Error>> {
        let mut conn = Connection::open(self.duckdb_path(meter_dir))?;
        self.ensure_schema(&conn)?;

        let mut day_files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(meter_dir)? {
            let path = entry?.path();
            if path.is_file() && day_of_filename(&path).is_some() {
                day_files.push(path);
            }
        }
        day_files.sort();

        let mut inserted = 0;
        for path in &day_files {
            inserted += self.insert_day_file(&mut conn, path)?;
        }
        let _ = conn.close();
        Ok(inserted)
    }

    /// Insert all rows of one day file in a single transaction.  A timestamp
    /// collision does nothing, never an update.
    fn insert_day_file(&self, conn: &mut Connection, path: &Path) -> Result<usize, Box<dyn Error>> {
        let record = self.read_file(path)?;
        let rows = record
            .rows()
            .map_err(|e| format!("{}: {}", path.display(), e))?;

        let tx = conn.transaction()?;
        let mut stmt = tx.prepare(
            r#"
INSERT INTO consumption_data
("timestamp", metered, estimated, metered_peak, estimated_peak, mean_profile)
VALUES (?::TIMESTAMP, ?, ?, ?, ?, ?)
ON CONFLICT ("timestamp") DO NOTHING;
            "#,
        )?;
        let mut inserted = 0;
        for row in &rows {
            inserted += stmt.execute(params![
                row.timestamp.to_string(),
                row.metered,
                row.estimated,
                row.metered_peak,
                row.estimated_peak,
                row.mean_profile,
            ])?;
        }
        tx.commit()?;
        debug!(
            "merged {} of {} rows from {}",
            inserted,
            rows.len(),
            path.display()
        );
        Ok(inserted)
    }

    /// Import every metering point directory under the storage root.  Stray
    /// files at the account level are skipped.  Returns the total number of
    /// newly inserted rows.
    pub fn update_duckdb_all(&self) -> Result<usize, Box<dyn Error>> {
        let mut total = 0;
        for account_entry in fs::read_dir(&self.base_dir)? {
            let account_path = account_entry?.path();
            if !account_path.is_dir() {
                continue;
            }
            for meter_entry in fs::read_dir(&account_path)? {
                let meter_path = meter_entry?.path();
                if !meter_path.is_dir() {
                    continue;
                }
                info!("importing day files from {} ...", meter_path.display());
                let inserted = self.update_duckdb(&meter_path)?;
                info!("  {} new rows", inserted);
                total += inserted;
            }
        }
        Ok(total)
    }

    /// All rows of one store, ordered by timestamp.
    pub fn get_data(&self, conn: &Connection) -> Result<Vec<Row>, Box<dyn Error>> {
        let mut stmt = conn.prepare(
            r#"
SELECT "timestamp", metered, estimated, metered_peak, estimated_peak, mean_profile
FROM consumption_data
ORDER BY "timestamp";
            "#,
        )?;
        let rows_iter = stmt.query_map([], |row| {
            Ok(Row {
                timestamp: match row.get_ref_unwrap(0) {
                    ValueRef::Timestamp(_, us) => Timestamp::from_microsecond(us)
                        .unwrap()
                        .to_zoned(TimeZone::UTC)
                        .datetime(),
                    _ => panic!("timestamp column is no longer a TIMESTAMP"),
                },
                metered: row.get(1)?,
                estimated: row.get(2)?,
                metered_peak: row.get(3)?,
                estimated_peak: row.get(4)?,
                mean_profile: row.get(5)?,
            })
        })?;
        let rows: Vec<Row> = rows_iter.map(|e| e.unwrap()).collect();
        Ok(rows)
    }
}

/// Every day from `start_date` up to but excluding `today`, ascending.
/// Today is always excluded, its record is still incomplete.
pub fn sync_days(start_date: Date, today: Date) -> Vec<Date> {
    start_date
        .series(1.day())
        .take_while(|day| *day < today)
        .collect()
}

/// The day a file holds, `None` for anything not named `<ISO date>.json`.
fn day_of_filename(path: &Path) -> Option<Date> {
    let ext = path.extension()?;
    if ext.to_str()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse::<Date>().ok()
}

/// Write then rename, so the existence check never sees a torn file.
fn write_day_file(path: &Path, record: &Map<String, Value>) -> Result<(), Box<dyn Error>> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
