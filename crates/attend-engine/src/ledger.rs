use chrono::{DateTime, Local, NaiveDate, NaiveTime, Timelike};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Column names and order; external tools read the file by these.
pub const LEDGER_HEADER: [&str; 4] = ["Roll No", "Name", "Date", "Time"];
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to lock ledger {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: Errno,
    },
    #[error("unexpected ledger header in {path}: {found:?}")]
    HeaderMismatch { path: PathBuf, found: Vec<String> },
}

/// One verified presence: at most one per (id, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    #[serde(rename = "Roll No")]
    pub id: String,
    #[serde(rename = "Name")]
    pub display_name: String,
    #[serde(rename = "Date", with = "date_format")]
    pub date: NaiveDate,
    #[serde(rename = "Time", with = "time_format")]
    pub time: NaiveTime,
}

/// What [`Ledger::record`] did. Both variants are success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(AttendanceRecord),
    /// The id was already marked that day; the existing row is returned untouched.
    AlreadyPresent(AttendanceRecord),
}

impl RecordOutcome {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            RecordOutcome::Recorded(r) | RecordOutcome::AlreadyPresent(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, RecordOutcome::Recorded(_))
    }
}

/// Append-only CSV attendance ledger.
///
/// Every operation holds a `flock` on the file for its duration, so the
/// read-check-append in [`record`](Self::record) is atomic across processes.
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    /// Open (or create) the ledger, writing the header into a new or empty file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let ledger = Self { path };
        let file = ledger.lock_exclusive()?;
        ledger.ensure_header(&file)?;
        ledger.read_records(&file)?;
        tracing::debug!(path = %ledger.path.display(), "ledger opened");
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a presence for `id` on the local date of `timestamp`.
    ///
    /// A second call for the same id and date leaves the ledger unchanged.
    pub fn record(
        &self,
        id: &str,
        display_name: &str,
        timestamp: DateTime<Local>,
    ) -> Result<RecordOutcome, LedgerError> {
        let date = timestamp.date_naive();
        let time = timestamp.time().with_nanosecond(0).unwrap_or_else(|| timestamp.time());

        let file = self.lock_exclusive()?;
        self.ensure_header(&file)?;

        if let Some(existing) = self
            .read_records(&file)?
            .into_iter()
            .find(|r| r.id == id && r.date == date)
        {
            tracing::debug!(id, %date, "attendance already recorded");
            return Ok(RecordOutcome::AlreadyPresent(existing));
        }

        let record = AttendanceRecord {
            id: id.to_string(),
            display_name: display_name.to_string(),
            date,
            time,
        };

        self.terminate_last_line(&file)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&*file);
        writer.serialize(&record)?;
        writer.flush().map_err(|source| self.io_error(source))?;

        tracing::info!(id, display_name, %date, time = %time.format(TIME_FORMAT), "attendance recorded");
        Ok(RecordOutcome::Recorded(record))
    }

    /// The record for `(id, date)`, if any.
    pub fn query(&self, id: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, LedgerError> {
        Ok(self
            .records()?
            .into_iter()
            .find(|r| r.id == id && r.date == date))
    }

    /// All records in file order.
    pub fn records(&self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let file = self.lock(FlockArg::LockShared, OpenOptions::new().read(true))?;
        self.read_records(&file)
    }

    pub fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        Ok(self.records()?.into_iter().filter(|r| r.date == date).collect())
    }

    fn io_error(&self, source: io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn lock_exclusive(&self) -> Result<Flock<File>, LedgerError> {
        self.lock(
            FlockArg::LockExclusive,
            OpenOptions::new().read(true).append(true).create(true),
        )
    }

    fn lock(&self, arg: FlockArg, options: &OpenOptions) -> Result<Flock<File>, LedgerError> {
        let file = options.open(&self.path).map_err(|e| self.io_error(e))?;
        Flock::lock(file, arg).map_err(|(_, source)| LedgerError::Lock {
            path: self.path.clone(),
            source,
        })
    }

    fn ensure_header(&self, file: &File) -> Result<(), LedgerError> {
        let len = file.metadata().map_err(|e| self.io_error(e))?.len();
        if len == 0 {
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(LEDGER_HEADER)?;
            writer.flush().map_err(|e| self.io_error(e))?;
            tracing::info!(path = %self.path.display(), "created attendance ledger");
        }
        Ok(())
    }

    fn read_records(&self, mut file: &File) -> Result<Vec<AttendanceRecord>, LedgerError> {
        file.seek(SeekFrom::Start(0)).map_err(|e| self.io_error(e))?;
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);

        let headers = reader.headers()?;
        // An empty file is a ledger with no rows yet.
        if !headers.is_empty() && !headers.iter().eq(LEDGER_HEADER) {
            return Err(LedgerError::HeaderMismatch {
                path: self.path.clone(),
                found: headers.iter().map(str::to_string).collect(),
            });
        }

        let records = reader.deserialize().collect::<Result<Vec<AttendanceRecord>, _>>()?;
        Ok(records)
    }

    /// Add a newline if a hand-edited file lacks one, so the append starts a new row.
    fn terminate_last_line(&self, mut file: &File) -> Result<(), LedgerError> {
        let len = file.metadata().map_err(|e| self.io_error(e))?.len();
        if len == 0 {
            return Ok(());
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| self.io_error(e))?;
        if last[0] != b'\n' {
            io::Write::write_all(&mut file, b"\n").map_err(|e| self.io_error(e))?;
        }
        Ok(())
    }
}

mod date_format {
    use super::DATE_FORMAT;
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &NaiveDate, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&date.format(DATE_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(serde::de::Error::custom)
    }
}

mod time_format {
    use super::TIME_FORMAT;
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&time.format(TIME_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, day, h, m, s).single().unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, day).unwrap()
    }

    #[test]
    fn test_open_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/attendance.csv");
        Ledger::open(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "Roll No,Name,Date,Time\n");
    }

    #[test]
    fn test_open_fills_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        fs::write(&path, b"").unwrap();
        Ledger::open(&path).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with("Roll No,Name,Date,Time"));
    }

    #[test]
    fn test_open_rejects_foreign_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        fs::write(&path, b"id,when\n").unwrap();
        assert!(matches!(Ledger::open(&path), Err(LedgerError::HeaderMismatch { .. })));
    }

    #[test]
    fn test_record_writes_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        let ledger = Ledger::open(&path).unwrap();

        let outcome = ledger.record("S1", "Alice", at(17, 9, 5, 7)).unwrap();
        assert!(outcome.is_new());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Roll No,Name,Date,Time\nS1,Alice,2026-10-17,09:05:07\n"
        );
    }

    #[test]
    fn test_same_day_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("attendance.csv")).unwrap();

        let first = ledger.record("S1", "Alice", at(17, 9, 0, 0)).unwrap();
        let second = ledger.record("S1", "Alice", at(17, 16, 30, 0)).unwrap();

        assert!(first.is_new());
        assert_eq!(second, RecordOutcome::AlreadyPresent(first.record().clone()));
        let records = ledger.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_at_most_one_record_per_id_and_day() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("attendance.csv")).unwrap();

        for (id, day, hour) in [
            ("S1", 17, 9),
            ("S2", 17, 9),
            ("S1", 17, 10),
            ("S1", 18, 9),
            ("S2", 17, 11),
            ("S1", 18, 12),
            ("S3", 18, 8),
        ] {
            ledger.record(id, "x", at(day, hour, 0, 0)).unwrap();
        }

        let records = ledger.records().unwrap();
        assert_eq!(records.len(), 4);
        let mut keys: Vec<_> = records.iter().map(|r| (r.id.clone(), r.date)).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), records.len());
    }

    #[test]
    fn test_query_and_records_on() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("attendance.csv")).unwrap();
        ledger.record("S1", "Alice", at(17, 9, 0, 0)).unwrap();
        ledger.record("S2", "Bob", at(18, 9, 0, 0)).unwrap();

        assert_eq!(ledger.query("S1", date(17)).unwrap().unwrap().display_name, "Alice");
        assert!(ledger.query("S1", date(18)).unwrap().is_none());
        assert_eq!(ledger.records_on(date(18)).unwrap().len(), 1);
    }

    #[test]
    fn test_reads_existing_crlf_file_without_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        fs::write(&path, "Roll No,Name,Date,Time\r\nS1,Alice,2026-10-17,08:00:00").unwrap();

        let ledger = Ledger::open(&path).unwrap();
        assert!(!ledger.record("S1", "Alice", at(17, 9, 0, 0)).unwrap().is_new());
        assert!(ledger.record("S2", "Bob", at(17, 9, 0, 0)).unwrap().is_new());

        let records = ledger.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, "S2");
    }

    #[test]
    fn test_names_with_commas_are_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        let ledger = Ledger::open(&path).unwrap();
        ledger.record("S1", "Lee, Mary", at(17, 9, 0, 0)).unwrap();

        assert!(fs::read_to_string(&path).unwrap().contains("S1,\"Lee, Mary\",2026-10-17"));
        assert_eq!(ledger.records().unwrap()[0].display_name, "Lee, Mary");
    }

    #[test]
    fn test_recreates_header_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        let ledger = Ledger::open(&path).unwrap();
        fs::write(&path, b"").unwrap();

        ledger.record("S1", "Alice", at(17, 9, 0, 0)).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Roll No,Name,Date,Time\nS1,Alice,2026-10-17,09:00:00\n"
        );
    }

    #[test]
    fn test_malformed_row_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        fs::write(&path, "Roll No,Name,Date,Time\nS1,Alice,yesterday,09:00:00\n").unwrap();
        assert!(matches!(Ledger::open(&path), Err(LedgerError::Csv(_))));
    }
}
