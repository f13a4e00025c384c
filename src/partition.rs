//! Time partition units.
//!
//! A partition key is the floor of a row timestamp (epoch microseconds, UTC)
//! under the table's partition unit. Partition directories are named by the
//! key: `2020-01-01T03` (hour), `2020-01-01` (day), `2020-01` (month),
//! `2020` (year).
//!
//! There is no "unpartitioned" variant: parallel ingest requires a partition
//! unit, so its absence is unrepresentable.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StampedeError};

const MICROS_PER_HOUR: i64 = 3_600_000_000;
const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Partition unit of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionBy {
    Hour,
    Day,
    Month,
    Year,
}

impl PartitionBy {
    /// Floor a timestamp (epoch micros, UTC) to its partition key.
    pub fn floor(&self, ts_micros: i64) -> i64 {
        match self {
            PartitionBy::Hour => ts_micros - ts_micros.rem_euclid(MICROS_PER_HOUR),
            PartitionBy::Day => ts_micros - ts_micros.rem_euclid(MICROS_PER_DAY),
            PartitionBy::Month => {
                let dt = utc(ts_micros);
                date_micros(dt.year(), dt.month(), 1)
            }
            PartitionBy::Year => {
                let dt = utc(ts_micros);
                date_micros(dt.year(), 1, 1)
            }
        }
    }

    /// Directory name for a partition key produced by [`floor`].
    ///
    /// [`floor`]: PartitionBy::floor
    pub fn dir_name(&self, key: i64) -> String {
        let dt = utc(key);
        match self {
            PartitionBy::Hour => format!(
                "{:04}-{:02}-{:02}T{:02}",
                dt.year(),
                dt.month(),
                dt.day(),
                dt.hour()
            ),
            PartitionBy::Day => format!("{:04}-{:02}-{:02}", dt.year(), dt.month(), dt.day()),
            PartitionBy::Month => format!("{:04}-{:02}", dt.year(), dt.month()),
            PartitionBy::Year => format!("{:04}", dt.year()),
        }
    }

    /// Parse a partition directory name back into its key.
    pub fn parse_dir_name(&self, name: &str) -> Result<i64> {
        let bad = || StampedeError::PartitionName(name.to_string());
        match self {
            PartitionBy::Hour => {
                let (date, hour) = name.split_once('T').ok_or_else(bad)?;
                let (y, m, d) = split_date(date).ok_or_else(bad)?;
                let h: i64 = hour.parse().map_err(|_| bad())?;
                if !(0..24).contains(&h) {
                    return Err(bad());
                }
                Ok(date_micros(y, m, d) + h * MICROS_PER_HOUR)
            }
            PartitionBy::Day => {
                let (y, m, d) = split_date(name).ok_or_else(bad)?;
                check_date(y, m, d).ok_or_else(bad)
            }
            PartitionBy::Month => {
                let (ys, ms) = name.split_once('-').ok_or_else(bad)?;
                let y: i32 = ys.parse().map_err(|_| bad())?;
                let m: u32 = ms.parse().map_err(|_| bad())?;
                check_date(y, m, 1).ok_or_else(bad)
            }
            PartitionBy::Year => {
                let y: i32 = name.parse().map_err(|_| bad())?;
                check_date(y, 1, 1).ok_or_else(bad)
            }
        }
    }
}

impl std::fmt::Display for PartitionBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PartitionBy::Hour => "HOUR",
            PartitionBy::Day => "DAY",
            PartitionBy::Month => "MONTH",
            PartitionBy::Year => "YEAR",
        };
        f.write_str(s)
    }
}

fn utc(ts_micros: i64) -> DateTime<Utc> {
    // Timestamps reach this module through the timestamp adapter, which only
    // produces values chrono can represent; clamp anything else to the epoch.
    DateTime::from_timestamp_micros(ts_micros).unwrap_or(DateTime::UNIX_EPOCH)
}

fn date_micros(year: i32, month: u32, day: u32) -> i64 {
    NaiveDate::from_ymd_opt(year, month, day)
        .map(|d| {
            d.and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp_micros())
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

fn check_date(year: i32, month: u32, day: u32) -> Option<i64> {
    let d = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros())
}

fn split_date(s: &str) -> Option<(i32, u32, u32)> {
    let mut parts = s.splitn(3, '-');
    let y = parts.next()?.parse().ok()?;
    let m = parts.next()?.parse().ok()?;
    let d = parts.next()?.parse().ok()?;
    Some((y, m, d))
}
