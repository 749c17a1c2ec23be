//! Validation polling loop: fetch, validate, write back, sleep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use datahub_adapters::{RecordStore, TabularSource};
use datahub_core::{EntryType, SubmissionEntry, ValidationOutcome};
use datahub_storage::CheckpointTracker;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::validator::Validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollState {
    Idle,
    Fetching,
    Validating,
    Writeback,
    Sleeping,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub validated: usize,
    /// Entries left alone: not a submission, already labelled, or without a data type.
    pub skipped: usize,
    /// Entries whose file could not be read this cycle.
    pub unreadable: usize,
    pub writeback_errors: usize,
    pub fetch_failed: bool,
    /// Checkpoint stored at the end of the cycle, if it advanced.
    pub checkpoint: Option<DateTime<Utc>>,
}

/// Fetch, validate, write back and sleep, forever or until stopped.
pub struct Poller {
    records: Arc<dyn RecordStore>,
    files: Arc<dyn TabularSource>,
    validator: Validator,
    checkpoint: CheckpointTracker,
    interval: Duration,
    state: PollState,
    /// States entered since the last `Fetching`, so one cycle at most.
    trail: Vec<PollState>,
    cycles: u64,
}

impl Poller {
    pub fn new(
        records: Arc<dyn RecordStore>,
        files: Arc<dyn TabularSource>,
        validator: Validator,
        checkpoint: CheckpointTracker,
        interval: Duration,
    ) -> Self {
        Self {
            records,
            files,
            validator,
            checkpoint,
            interval,
            state: PollState::Idle,
            trail: Vec::new(),
            cycles: 0,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// States of the most recent cycle in the order they were entered.
    pub fn trail(&self) -> &[PollState] {
        &self.trail
    }

    fn transition(&mut self, next: PollState) {
        debug!(from = ?self.state, to = ?next, "poller state");
        if next == PollState::Fetching {
            self.trail.clear();
        }
        self.trail.push(next);
        self.state = next;
    }

    /// One pass from `Fetching` through `Writeback`. Never fails; problems land in the report.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        self.transition(PollState::Fetching);
        let fetch_time = Utc::now();
        let checkpoint = self.checkpoint.load().await;
        let window_start = self.checkpoint.window_start(checkpoint);
        let entries = match self.records.query_unvalidated_since(window_start).await {
            Ok(entries) => entries,
            Err(err) => {
                error!(error = %err, %window_start, "fetching unvalidated entries failed");
                report.fetch_failed = true;
                return report;
            }
        };
        report.fetched = entries.len();

        self.transition(PollState::Validating);
        let mut results = Vec::new();
        for entry in &entries {
            match self.validate_entry(entry).await {
                EntryCheck::Validated(outcome) => results.push((entry.id.as_str(), outcome)),
                EntryCheck::Skipped => report.skipped += 1,
                EntryCheck::Unreadable => report.unreadable += 1,
            }
        }
        report.validated = results.len();

        self.transition(PollState::Writeback);
        for (id, outcome) in &results {
            if let Err(err) = self.write_back(id, outcome).await {
                warn!(entry_id = %id, error = %err, "validation writeback failed");
                report.writeback_errors += 1;
            }
        }

        if report.writeback_errors == 0 {
            match self.checkpoint.save(fetch_time).await {
                Ok(saved) => report.checkpoint = Some(saved),
                Err(err) => error!(error = %format!("{err:#}"), "saving checkpoint failed"),
            }
        }
        report
    }

    async fn validate_entry(&self, entry: &SubmissionEntry) -> EntryCheck {
        if entry.entry_type != EntryType::Submission || entry.is_labelled() {
            return EntryCheck::Skipped;
        }
        let Some(data_type) = entry.data_type else {
            warn!(entry_id = %entry.id, "submission has no data type; skipping");
            return EntryCheck::Skipped;
        };
        match self.files.read_table(&entry.file_url).await {
            Ok(table) => {
                let outcome = self.validator.validate(data_type, &table);
                info!(
                    entry_id = %entry.id,
                    file_name = %entry.file_name,
                    %data_type,
                    labels = ?outcome.labels(),
                    "validated submission"
                );
                EntryCheck::Validated(outcome)
            }
            Err(err) => {
                warn!(entry_id = %entry.id, file_name = %entry.file_name, error = %err, "reading submission failed");
                EntryCheck::Unreadable
            }
        }
    }

    async fn write_back(
        &self,
        id: &str,
        outcome: &ValidationOutcome,
    ) -> Result<(), datahub_adapters::RecordStoreError> {
        self.records.set_validated_flag(id, outcome.is_ok()).await?;
        self.records.set_validation_labels(id, outcome.labels()).await
    }

    /// Loop until `stop` turns true or its sender goes away.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "poller started");
        while !*stop.borrow() {
            self.cycles += 1;
            let span = info_span!("poll_cycle", cycle = self.cycles);
            let report = self.run_cycle().instrument(span).await;
            info!(
                cycle = self.cycles,
                fetched = report.fetched,
                validated = report.validated,
                skipped = report.skipped,
                unreadable = report.unreadable,
                writeback_errors = report.writeback_errors,
                fetch_failed = report.fetch_failed,
                "poll cycle finished"
            );

            self.transition(PollState::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            self.transition(PollState::Idle);
        }
        if self.state != PollState::Idle {
            self.transition(PollState::Idle);
        }
        info!(cycles = self.cycles, "poller stopped");
    }
}

enum EntryCheck {
    Validated(ValidationOutcome),
    Skipped,
    Unreadable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReferenceData;
    use crate::validator::MERCHANT_COLUMNS;
    use chrono::{NaiveDate, TimeZone};
    use datahub_adapters::{InMemoryRecordStore, InMemoryTabularSource, StubFile};
    use datahub_core::{DataType, PopulatedFlag, Table, ValidationLabel};
    use tempfile::tempdir;

    fn entry(id: &str, data_type: DataType) -> SubmissionEntry {
        SubmissionEntry {
            id: id.to_string(),
            title: "Egypt Q1".into(),
            entry_type: EntryType::Submission,
            data_type: Some(data_type),
            team_member: Some("amira".into()),
            file_url: format!("https://files.example.com/{id}.csv"),
            file_name: format!("{id}.csv"),
            submission_date: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            created_at: Utc::now() - chrono::Duration::hours(1),
            validation_labels: vec![],
            validated: None,
            populated: PopulatedFlag::Empty,
        }
    }

    fn good_merchants() -> Table {
        Table::from_rows(
            MERCHANT_COLUMNS,
            &[&[
                "Carrefour", "1", "Groceries", "", "carrefour.eg", "", "Egypt", "", "", "",
            ]],
        )
    }

    fn poller(
        records: Arc<InMemoryRecordStore>,
        files: InMemoryTabularSource,
        checkpoint_path: std::path::PathBuf,
    ) -> Poller {
        Poller::new(
            records,
            Arc::new(files),
            Validator::new(ReferenceData::new(["Groceries"], ["Egypt"])),
            CheckpointTracker::new(checkpoint_path, chrono::Duration::days(10)),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn cycle_labels_entries_and_advances_checkpoint() {
        let dir = tempdir().unwrap();
        let records = Arc::new(InMemoryRecordStore::new(vec![
            entry("good", DataType::Merchants),
            entry("bad", DataType::ReviewedTransactions),
        ]));
        let files = InMemoryTabularSource::new()
            .with_table("https://files.example.com/good.csv", good_merchants())
            .with_table(
                "https://files.example.com/bad.csv",
                Table::from_rows(&["description"], &[&["POS 1"]]),
            );
        let mut poller = poller(records.clone(), files, dir.path().join("last_checked.txt"));

        let before = Utc::now();
        let report = poller.run_cycle().await;
        assert_eq!(report.validated, 2);
        assert!(report.checkpoint.unwrap() >= before);

        let good = records.get("good").await.unwrap();
        assert_eq!(good.validation_labels, vec![ValidationLabel::Ok]);
        assert_eq!(good.validated, Some(true));
        let bad = records.get("bad").await.unwrap();
        assert_eq!(bad.validation_labels, vec![ValidationLabel::InvalidColumnName]);
        assert_eq!(bad.validated, Some(false));
        assert!(dir.path().join("last_checked.txt").exists());
    }

    #[tokio::test]
    async fn labelled_entries_are_never_relabelled() {
        let dir = tempdir().unwrap();
        let records = Arc::new(InMemoryRecordStore::new(vec![entry("bad", DataType::ReviewedTransactions)]));
        let files = InMemoryTabularSource::new().with_table(
            "https://files.example.com/bad.csv",
            Table::from_rows(&["description"], &[]),
        );
        let mut poller = poller(records.clone(), files, dir.path().join("cp.txt"));

        poller.run_cycle().await;
        let writes = records.write_count();
        assert_eq!(writes, 2);

        let second = poller.run_cycle().await;
        assert_eq!(second.fetched, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(records.write_count(), writes);
    }

    #[tokio::test]
    async fn cycle_enters_states_in_order() {
        let dir = tempdir().unwrap();
        let records = Arc::new(InMemoryRecordStore::new(vec![entry("good", DataType::Merchants)]));
        let files = InMemoryTabularSource::new().with_table("https://files.example.com/good.csv", good_merchants());
        let mut poller = poller(records, files, dir.path().join("cp.txt"));
        assert_eq!(poller.state(), PollState::Idle);

        poller.run_cycle().await;
        assert_eq!(
            poller.trail(),
            &[PollState::Fetching, PollState::Validating, PollState::Writeback]
        );
    }

    async fn run_one_cycle(mut poller: Poller) -> Vec<PollState> {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            poller.run(rx).await;
            poller.trail().to_vec()
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn run_sleeps_after_writeback_then_idles() {
        let dir = tempdir().unwrap();
        let records = Arc::new(InMemoryRecordStore::new(vec![entry("good", DataType::Merchants)]));
        let files = InMemoryTabularSource::new().with_table("https://files.example.com/good.csv", good_merchants());

        let trail = run_one_cycle(poller(records, files, dir.path().join("cp.txt"))).await;
        assert_eq!(
            trail,
            vec![
                PollState::Fetching,
                PollState::Validating,
                PollState::Writeback,
                PollState::Sleeping,
                PollState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn fetch_failure_goes_straight_to_sleeping() {
        let dir = tempdir().unwrap();
        let records = Arc::new(InMemoryRecordStore::new(vec![entry("good", DataType::Merchants)]));
        records.set_unavailable(true);

        let trail = run_one_cycle(poller(records, InMemoryTabularSource::new(), dir.path().join("cp.txt"))).await;
        assert_eq!(trail, vec![PollState::Fetching, PollState::Sleeping, PollState::Idle]);
    }

    #[tokio::test]
    async fn fetch_failure_keeps_checkpoint() {
        let dir = tempdir().unwrap();
        let records = Arc::new(InMemoryRecordStore::new(vec![entry("good", DataType::Merchants)]));
        records.set_unavailable(true);
        let mut poller = poller(records, InMemoryTabularSource::new(), dir.path().join("cp.txt"));

        let report = poller.run_cycle().await;
        assert!(report.fetch_failed);
        assert_eq!(report.checkpoint, None);
        assert!(!dir.path().join("cp.txt").exists());
    }

    #[tokio::test]
    async fn unreadable_file_is_skipped_without_blocking_others() {
        let dir = tempdir().unwrap();
        let records = Arc::new(InMemoryRecordStore::new(vec![
            entry("locked", DataType::Merchants),
            entry("good", DataType::Merchants),
        ]));
        let files = InMemoryTabularSource::new()
            .with_file("https://files.example.com/locked.csv", StubFile::AccessDenied)
            .with_table("https://files.example.com/good.csv", good_merchants());
        let mut poller = poller(records.clone(), files, dir.path().join("cp.txt"));

        let report = poller.run_cycle().await;
        assert_eq!(report.unreadable, 1);
        assert_eq!(report.validated, 1);
        assert!(report.checkpoint.is_some());
        assert!(records.get("locked").await.unwrap().validation_labels.is_empty());
    }

    #[tokio::test]
    async fn old_entries_fall_outside_the_lookback_window() {
        let dir = tempdir().unwrap();
        let mut stale = entry("stale", DataType::Merchants);
        stale.created_at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap();
        let records = Arc::new(InMemoryRecordStore::new(vec![stale]));
        let mut poller = poller(records, InMemoryTabularSource::new(), dir.path().join("cp.txt"));

        let report = poller.run_cycle().await;
        assert_eq!(report.fetched, 0);
    }

    #[tokio::test]
    async fn run_returns_when_stopped() {
        let dir = tempdir().unwrap();
        let records = Arc::new(InMemoryRecordStore::new(vec![]));
        let mut poller = poller(records, InMemoryTabularSource::new(), dir.path().join("cp.txt"));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            poller.run(rx).await;
            poller.state()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, PollState::Idle);
    }
}
