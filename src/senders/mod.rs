//! Outbound result senders.
//!
//! A sender receives every finished [`CalculationResult`]. Unsuccessful results are skipped
//! and failures are logged, so a broken destination never holds up the measurement.
//!
//! - [`SummaryFileSender`]: one text file per measurement
//! - [`ResultsCsvSender`]: one row per measurement in a shared `results.csv`

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::SendersConfig;
use crate::error::{AppResult, StationError};
use crate::result::{CalculationResult, CalculationStatus};

/// A destination for finished measurements.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Sender name for logs.
    fn name(&self) -> &str;

    /// Prepare the destination.
    async fn connect(&self) -> AppResult<()>;

    /// Deliver `result`. Returns false when skipped or failed.
    async fn send(&self, result: &CalculationResult) -> bool;
}

/// All configured senders.
#[derive(Default, Clone)]
pub struct SenderSet {
    senders: Vec<Arc<dyn RequestSender>>,
}

impl SenderSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Senders described by the `[senders]` section.
    pub fn from_config(config: &SendersConfig) -> Self {
        let mut set = Self::new();
        if let Some(dir) = &config.summary_dir {
            set.add(Arc::new(SummaryFileSender::new(dir.clone())));
        }
        if let Some(dir) = &config.results_dir {
            set.add(Arc::new(ResultsCsvSender::new(dir)));
        }
        set
    }

    /// Add a sender.
    pub fn add(&mut self, sender: Arc<dyn RequestSender>) {
        self.senders.push(sender);
    }

    /// Number of senders.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// True when no sender is configured.
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Connect every sender; failures are logged and skipped.
    pub async fn connect_all(&self) {
        for sender in &self.senders {
            if let Err(e) = sender.connect().await {
                error!(sender = sender.name(), "Failed to connect sender: {}", e);
            }
        }
    }

    /// Send `result` to every sender, in order. Returns each sender's outcome.
    pub async fn send_all(&self, result: &CalculationResult) -> Vec<(String, bool)> {
        let mut outcomes = Vec::with_capacity(self.senders.len());
        for sender in &self.senders {
            let sent = sender.send(result).await;
            if !sent && result.status == CalculationStatus::Successful {
                warn!(sender = sender.name(), barcode = %result.barcode, "Sender did not deliver the result");
            }
            outcomes.push((sender.name().to_string(), sent));
        }
        outcomes
    }
}

/// Writes one `<barcode>_<yyyyMMddHHmmss>.txt` summary per successful measurement.
pub struct SummaryFileSender {
    directory: PathBuf,
}

impl SummaryFileSender {
    /// Sender writing into `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// File name for `result`. The barcode is reduced to a single safe path component.
    pub fn file_name(result: &CalculationResult) -> String {
        format!(
            "{}_{}.txt",
            safe_file_stem(&result.barcode),
            result.timestamp.format("%Y%m%d%H%M%S")
        )
    }

    /// Summary text for `result`.
    pub fn summary(result: &CalculationResult) -> String {
        format!(
            "barcode={}\nweightGr={}\nlengthMm={}\nwidthMm={}\nheightMm={}\nunits={}\ncomment={}\n",
            result.barcode,
            result.weight_g,
            result.length_mm,
            result.width_mm,
            result.height_mm,
            result.unit_count,
            result.comment
        )
    }

    async fn write(&self, result: &CalculationResult) -> AppResult<PathBuf> {
        let path = self.directory.join(Self::file_name(result));
        tokio::fs::write(&path, Self::summary(result)).await?;
        Ok(path)
    }
}

#[async_trait]
impl RequestSender for SummaryFileSender {
    fn name(&self) -> &str {
        "summary-file"
    }

    async fn connect(&self) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| StationError::Sender {
                sender: self.name().to_string(),
                message: format!("cannot create {}: {}", self.directory.display(), e),
            })
    }

    async fn send(&self, result: &CalculationResult) -> bool {
        if result.status != CalculationStatus::Successful {
            info!(status = ?result.status, "The result was not successful, will not write a summary");
            return false;
        }

        match self.write(result).await {
            Ok(path) => {
                info!(path = %path.display(), "Wrote result summary");
                true
            }
            Err(e) => {
                error!(directory = %self.directory.display(), "Failed to write result summary: {}", e);
                false
            }
        }
    }
}

const NO_BARCODE_STEM: &str = "no_barcode";

/// Keep letters, digits, `-`, `_` and inner dots; anything else becomes `_`.
fn safe_file_stem(barcode: &str) -> String {
    let stem: String = barcode
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_matches('.').replace("..", "_");
    if stem.is_empty() {
        NO_BARCODE_STEM.to_string()
    } else {
        stem
    }
}

/// File the CSV sender appends to.
pub const RESULTS_FILE_NAME: &str = "results.csv";

const RESULTS_HEADER: [&str; 11] = [
    "#",
    "date local",
    "time local",
    "code",
    "weight (kg)",
    "units",
    "length (mm)",
    "width (mm)",
    "height (mm)",
    "volume (mm^3)",
    "comment",
];

/// Appends one row per successful measurement to `<directory>/results.csv`.
///
/// The header is written when the file is created. Row numbers continue from the rows
/// already in the file.
pub struct ResultsCsvSender {
    path: PathBuf,
    next_index: Mutex<u64>,
}

impl ResultsCsvSender {
    /// Sender writing `results.csv` into `directory`.
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            path: directory.as_ref().join(RESULTS_FILE_NAME),
            next_index: Mutex::new(1),
        }
    }

    /// Path of the results file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sender_error(&self, message: impl std::fmt::Display) -> StationError {
        StationError::Sender {
            sender: self.name().to_string(),
            message: format!("{}: {}", self.path.display(), message),
        }
    }

    fn existing_rows(&self) -> AppResult<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| self.sender_error(e))?;
        Ok(reader.records().filter(Result::is_ok).count() as u64)
    }

    fn append(&self, result: &CalculationResult) -> AppResult<u64> {
        let mut next_index = self.next_index.lock();
        let created = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut writer = csv::Writer::from_writer(file);
        if created {
            writer
                .write_record(RESULTS_HEADER)
                .map_err(|e| self.sender_error(e))?;
        }

        let index = *next_index;
        let volume = i64::from(result.length_mm)
            * i64::from(result.width_mm)
            * i64::from(result.height_mm);
        writer
            .write_record([
                index.to_string(),
                result.timestamp.format("%d.%m.%Y").to_string(),
                result.timestamp.format("%H:%M:%S").to_string(),
                result.barcode.clone(),
                format!("{:.3}", result.weight_kg()),
                result.unit_count.to_string(),
                result.length_mm.to_string(),
                result.width_mm.to_string(),
                result.height_mm.to_string(),
                volume.to_string(),
                result.comment.clone(),
            ])
            .map_err(|e| self.sender_error(e))?;
        writer.flush()?;

        *next_index = index + 1;
        Ok(index)
    }
}

#[async_trait]
impl RequestSender for ResultsCsvSender {
    fn name(&self) -> &str {
        "results-csv"
    }

    async fn connect(&self) -> AppResult<()> {
        if let Some(directory) = self.path.parent() {
            tokio::fs::create_dir_all(directory)
                .await
                .map_err(|e| self.sender_error(e))?;
        }
        let rows = self.existing_rows()?;
        *self.next_index.lock() = rows + 1;
        info!(path = %self.path.display(), rows, "Results file ready");
        Ok(())
    }

    async fn send(&self, result: &CalculationResult) -> bool {
        if result.status != CalculationStatus::Successful {
            debug!(status = ?result.status, "The result was not successful, will not append a row");
            return false;
        }

        match self.append(result) {
            Ok(index) => {
                info!(index, barcode = %result.barcode, "Appended result row");
                true
            }
            Err(e) => {
                error!("Failed to append result row: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use tempfile::tempdir;

    fn result(status: CalculationStatus) -> CalculationResult {
        CalculationResult {
            barcode: "BOX42".into(),
            weight_g: 1234.0,
            length_mm: 300,
            width_mm: 200,
            height_mm: 100,
            unit_count: 2,
            comment: "ok".into(),
            status,
            timestamp: Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap(),
        }
    }

    #[test]
    fn test_file_name() {
        assert_eq!(
            SummaryFileSender::file_name(&result(CalculationStatus::Successful)),
            "BOX42_20240305140709.txt"
        );
    }

    #[tokio::test]
    async fn test_writes_successful_results_only() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out");
        let sender = SummaryFileSender::new(&target);
        sender.connect().await.unwrap();

        assert!(!sender.send(&result(CalculationStatus::TimedOut)).await);
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 0);

        assert!(sender.send(&result(CalculationStatus::Successful)).await);
        let text = std::fs::read_to_string(target.join("BOX42_20240305140709.txt")).unwrap();
        assert!(text.contains("barcode=BOX42\n"));
        assert!(text.contains("lengthMm=300\n"));
        assert!(text.contains("units=2\n"));
    }

    #[tokio::test]
    async fn test_barcode_cannot_leave_summary_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out");
        let sender = SummaryFileSender::new(&target);
        sender.connect().await.unwrap();

        let mut escaping = result(CalculationStatus::Successful);
        escaping.barcode = "../escaped".into();
        assert!(sender.send(&escaping).await);

        let written: Vec<_> = std::fs::read_dir(&target)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(written, vec!["_escaped_20240305140709.txt".to_string()]);
        let outside: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(outside.len(), 1, "only the target directory may exist");
    }

    #[test]
    fn test_safe_file_stem() {
        assert_eq!(safe_file_stem("BOX-42_a.b"), "BOX-42_a.b");
        assert_eq!(safe_file_stem("a/b\\c:d"), "a_b_c_d");
        assert_eq!(safe_file_stem(".."), "no_barcode");
        assert_eq!(safe_file_stem(""), "no_barcode");
        assert_eq!(safe_file_stem("x..y"), "x_y");
    }

    #[tokio::test]
    async fn test_results_csv_appends_rows_after_header() {
        let dir = tempdir().unwrap();
        let sender = ResultsCsvSender::new(dir.path().join("results"));
        sender.connect().await.unwrap();

        let mut first = result(CalculationStatus::Successful);
        first.comment = "fragile, top".into();
        assert!(sender.send(&first).await);
        assert!(!sender.send(&result(CalculationStatus::WeightNotStable)).await);
        assert!(sender.send(&result(CalculationStatus::Successful)).await);

        let mut reader = csv::Reader::from_path(sender.path()).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, RESULTS_HEADER);
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "1");
        assert_eq!(&rows[0][1], "05.03.2024");
        assert_eq!(&rows[0][2], "14:07:09");
        assert_eq!(&rows[0][3], "BOX42");
        assert_eq!(&rows[0][4], "1.234");
        assert_eq!(&rows[0][5], "2");
        assert_eq!(&rows[0][9], "6000000");
        assert_eq!(&rows[0][10], "fragile, top");
        assert_eq!(&rows[1][0], "2");
    }

    #[tokio::test]
    async fn test_results_csv_continues_existing_file() {
        let dir = tempdir().unwrap();
        let first = ResultsCsvSender::new(dir.path());
        first.connect().await.unwrap();
        assert!(first.send(&result(CalculationStatus::Successful)).await);

        let reopened = ResultsCsvSender::new(dir.path());
        reopened.connect().await.unwrap();
        assert!(reopened.send(&result(CalculationStatus::Successful)).await);

        let text = std::fs::read_to_string(dir.path().join(RESULTS_FILE_NAME)).unwrap();
        assert_eq!(text.lines().filter(|line| line.starts_with("#,")).count(), 1);
        let mut reader = csv::Reader::from_path(reopened.path()).unwrap();
        let indices: Vec<String> = reader
            .records()
            .map(|record| record.unwrap()[0].to_string())
            .collect();
        assert_eq!(indices, ["1", "2"]);
    }

    #[tokio::test]
    async fn test_set_reports_failures_without_stopping() {
        let dir = tempdir().unwrap();
        let mut set = SenderSet::new();
        // Missing directory: never connected
        set.add(Arc::new(SummaryFileSender::new(dir.path().join("missing"))));
        set.add(Arc::new(SummaryFileSender::new(dir.path())));

        let outcomes = set.send_all(&result(CalculationStatus::Successful)).await;
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].1);
        assert!(outcomes[1].1);
    }
}
