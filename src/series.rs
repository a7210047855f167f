//! Загрузка почасовых рядов потребления из CSV и операции над ними:
//! разбиение на обучение/отложенную часть, будущий индекс, выравнивание регрессоров.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use serde::Deserialize;

use crate::constants::TIMESTAMP_FORMAT;

const TIME_FORMAT_MINUTES: &str = "%Y-%m-%d %H:%M";
const TIME_FORMAT_ISO: &str = "%Y-%m-%dT%H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

const ERROR_EMPTY_TIMESTAMP: &str = "empty timestamp";
const ERROR_UNRECOGNIZED_TIME: &str = "unrecognized time format";

#[derive(Clone, Copy, Debug)]
enum TimeFormatHint {
    Seconds,
    Minutes,
    Iso,
    Rfc3339,
    Date,
}

impl TimeFormatHint {
    const ALL: [Self; 5] = [
        Self::Seconds,
        Self::Minutes,
        Self::Iso,
        Self::Rfc3339,
        Self::Date,
    ];

    fn parse(self, raw: &str) -> Option<NaiveDateTime> {
        match self {
            Self::Seconds => NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).ok(),
            Self::Minutes => NaiveDateTime::parse_from_str(raw, TIME_FORMAT_MINUTES).ok(),
            Self::Iso => NaiveDateTime::parse_from_str(raw, TIME_FORMAT_ISO).ok(),
            Self::Rfc3339 => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_local()),
            Self::Date => NaiveDate::parse_from_str(raw, DATE_FORMAT)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0)),
        }
    }
}

/// Строка CSV: `ds`, `y` и необязательные экзогенные признаки.
#[derive(Debug, Deserialize)]
struct CsvRow {
    ds: String,
    y: f64,
    demand: Option<f64>,
    #[serde(rename = "temp thresh", alias = "temp_thresh")]
    temp_thresh: Option<f64>,
}

impl CsvRow {
    fn regressor(&self, name: &str) -> Option<f64> {
        match name {
            "demand" => self.demand,
            "temp thresh" => self.temp_thresh,
            _ => None,
        }
    }
}

/// Почасовой ряд: метки времени строго возрастают.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HourlyFrame {
    pub ds: Vec<NaiveDateTime>,
    pub y: Vec<f64>,
    pub regressors: BTreeMap<String, Vec<f64>>,
}

impl HourlyFrame {
    pub const fn len(&self) -> usize {
        self.ds.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.ds.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.ds.last().copied()
    }

    pub fn regressor(&self, name: &str) -> Option<&[f64]> {
        self.regressors.get(name).map(Vec::as_slice)
    }

    /// Делит ряд по границе: всё строго раньше `boundary` и всё начиная с неё.
    pub fn split_at(&self, boundary: NaiveDateTime) -> (Self, Self) {
        let cut = self.ds.partition_point(|ts| *ts < boundary);
        (self.slice(0, cut), self.slice(cut, self.len()))
    }

    /// Последние `n` строк (или весь ряд, если он короче).
    pub fn tail(&self, n: usize) -> Self {
        self.slice(self.len().saturating_sub(n), self.len())
    }

    /// Значения регрессора для каждой метки `index` по точному совпадению времени.
    pub fn align(
        &self,
        name: &str,
        index: &[NaiveDateTime],
    ) -> Result<Vec<f64>, Box<dyn Error + Send + Sync>> {
        let values = self
            .regressor(name)
            .ok_or_else(|| format!("dataset has no regressor '{name}'"))?;
        let positions: HashMap<NaiveDateTime, usize> = self
            .ds
            .iter()
            .enumerate()
            .map(|(idx, ts)| (*ts, idx))
            .collect();
        index
            .iter()
            .map(|ts| {
                positions.get(ts).map(|&idx| values[idx]).ok_or_else(|| {
                    format!("no '{name}' value for {}", ts.format(TIMESTAMP_FORMAT)).into()
                })
            })
            .collect()
    }

    fn slice(&self, start: usize, end: usize) -> Self {
        Self {
            ds: self.ds[start..end].to_vec(),
            y: self.y[start..end].to_vec(),
            regressors: self
                .regressors
                .iter()
                .map(|(name, values)| (name.clone(), values[start..end].to_vec()))
                .collect(),
        }
    }
}

/// Читает CSV с колонками `ds`, `y` и запрошенными регрессорами.
pub fn load_frame(
    csv_path: &Path,
    regressors: &[&str],
) -> Result<HourlyFrame, Box<dyn Error + Send + Sync>> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut hint = None;
    let mut frame = HourlyFrame {
        regressors: regressors
            .iter()
            .map(|name| ((*name).to_string(), Vec::new()))
            .collect(),
        ..HourlyFrame::default()
    };

    for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
        let row = row?;
        let ts = parse_timestamp_with_hint(&row.ds, &mut hint)
            .map_err(|err| format!("failed to parse ds '{}': {err}", row.ds))?;
        if let Some(prev) = frame.last_timestamp()
            && ts <= prev
        {
            return Err(format!(
                "row {}: timestamp {} is not after {}",
                line + 1,
                ts.format(TIMESTAMP_FORMAT),
                prev.format(TIMESTAMP_FORMAT)
            )
            .into());
        }
        for name in regressors {
            let value = row
                .regressor(name)
                .ok_or_else(|| format!("row {}: missing value for '{name}'", line + 1))?;
            if let Some(column) = frame.regressors.get_mut(*name) {
                column.push(value);
            }
        }
        frame.ds.push(ts);
        frame.y.push(row.y);
    }

    if frame.is_empty() {
        return Err(format!("{} contains no rows", csv_path.display()).into());
    }

    let gaps = count_gaps(&frame.ds);
    if gaps > 0 {
        tracing::warn!(
            path = %csv_path.display(),
            gaps,
            "Series has non-hourly steps"
        );
    }
    Ok(frame)
}

/// `periods` почасовых меток сразу после `last`.
pub fn future_index(last: NaiveDateTime, periods: usize) -> Vec<NaiveDateTime> {
    (1..=periods)
        .map(|step| last + Duration::hours(step as i64))
        .collect()
}

pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, String> {
    parse_timestamp_with_hint(raw, &mut None)
}

/// Парсит метку времени, запоминая последний удачный формат.
fn parse_timestamp_with_hint(
    raw: &str,
    hint: &mut Option<TimeFormatHint>,
) -> Result<NaiveDateTime, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ERROR_EMPTY_TIMESTAMP.into());
    }

    if let Some(known) = *hint
        && let Some(parsed) = known.parse(trimmed)
    {
        return Ok(parsed);
    }

    for candidate in TimeFormatHint::ALL {
        if let Some(parsed) = candidate.parse(trimmed) {
            *hint = Some(candidate);
            return Ok(parsed);
        }
    }

    Err(ERROR_UNRECOGNIZED_TIME.into())
}

fn count_gaps(ds: &[NaiveDateTime]) -> usize {
    ds.windows(2)
        .filter(|pair| pair[1] - pair[0] != Duration::hours(1))
        .count()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).expect("valid timestamp")
    }

    fn write_csv(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(body.as_bytes()).expect("write csv");
        file
    }

    #[test]
    fn parses_supported_timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2021, 5, 25)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid date");
        for raw in [
            "2021-05-25 00:00:00",
            "2021-05-25 00:00",
            "2021-05-25T00:00:00",
            "2021-05-25T00:00:00+00:00",
            "2021-05-25",
        ] {
            assert_eq!(parse_timestamp(raw), Ok(expected), "{raw}");
        }
        assert!(parse_timestamp("").is_err());
        assert!(parse_timestamp("25/05/2021").is_err());
    }

    #[test]
    fn loads_multivariate_columns_and_ignores_extra_ones() {
        let file = write_csv(
            "Unnamed: 0,ds,y,demand,temp thresh\n\
             0,2021-05-24 22:00:00,10.5,3.0,1\n\
             1,2021-05-24 23:00:00,11.0,3.5,0\n",
        );
        let frame = load_frame(file.path(), &["demand", "temp thresh"]).expect("frame");
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.y, vec![10.5, 11.0]);
        assert_eq!(frame.regressor("demand"), Some(&[3.0, 3.5][..]));
        assert_eq!(frame.regressor("temp thresh"), Some(&[1.0, 0.0][..]));
    }

    #[test]
    fn rejects_duplicate_timestamps() {
        let file = write_csv("ds,y\n2021-05-24 22:00:00,1\n2021-05-24 22:00:00,2\n");
        let err = load_frame(file.path(), &[]).expect_err("duplicate must fail");
        assert!(err.to_string().contains("is not after"));
    }

    #[test]
    fn rejects_missing_regressor_values() {
        let file = write_csv("ds,y,demand\n2021-05-24 22:00:00,1,\n");
        let err = load_frame(file.path(), &["demand"]).expect_err("empty regressor");
        assert!(err.to_string().contains("missing value for 'demand'"));
    }

    #[test]
    fn split_puts_boundary_row_into_held_out_part() {
        let start = ts("2021-05-24 22:00:00");
        let frame = HourlyFrame {
            ds: vec![
                start,
                start + Duration::hours(1),
                start + Duration::hours(2),
            ],
            y: vec![1.0, 2.0, 3.0],
            regressors: BTreeMap::new(),
        };
        let (train, test) = frame.split_at(ts("2021-05-25 00:00:00"));
        assert_eq!(train.y, vec![1.0, 2.0]);
        assert_eq!(test.ds, vec![ts("2021-05-25 00:00:00")]);
    }

    #[test]
    fn future_index_is_hourly_after_last_timestamp() {
        let last = ts("2021-05-24 23:00:00");
        let index = future_index(last, 168);
        assert_eq!(index.len(), 168);
        assert_eq!(index[0], ts("2021-05-25 00:00:00"));
        assert_eq!(count_gaps(&index), 0);
        assert_eq!(index[167], ts("2021-05-31 23:00:00"));
    }

    #[test]
    fn align_matches_by_exact_timestamp() {
        let start = ts("2021-05-25 00:00:00");
        let frame = HourlyFrame {
            ds: vec![start, start + Duration::hours(1)],
            y: vec![0.0, 0.0],
            regressors: BTreeMap::from([("demand".to_string(), vec![7.0, 8.0])]),
        };
        let aligned = frame
            .align("demand", &[start + Duration::hours(1), start])
            .expect("aligned");
        assert_eq!(aligned, vec![8.0, 7.0]);
        assert!(
            frame
                .align("demand", &[start + Duration::hours(5)])
                .is_err()
        );
        assert!(frame.align("temp thresh", &[start]).is_err());
    }
}
