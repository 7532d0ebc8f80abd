//! Ingestion cycle orchestration: fetch, fingerprint, compare, record.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sweet_core::{parse_company_tickers, CompanyTicker, Fingerprint, FingerprintRecord};
use sweet_storage::{
    DatasetSource, FetchError, FetcherConfig, FingerprintStore, HttpDatasetFetcher, LookupStore,
    SqliteStore, StoreError,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_DATABASE_PATH: &str = "src/db/sweet.db";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Resolved against the working directory when relative.
    pub database_path: PathBuf,
    pub fetcher: FetcherConfig,
    pub store_timeout: Duration,
    pub load_lookup: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            fetcher: FetcherConfig::default(),
            store_timeout: Duration::from_secs(10),
            load_lookup: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut fetcher = defaults.fetcher;
        if let Ok(url) = std::env::var("SWEET_TICKERS_URL") {
            fetcher.url = url;
        }
        if let Ok(user_agent) = std::env::var("SWEET_USER_AGENT") {
            fetcher.identity.user_agent = user_agent;
        }
        if let Some(secs) = std::env::var("SWEET_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            fetcher.timeout = Duration::from_secs(secs);
        }

        Self {
            database_path: std::env::var("SWEET_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            fetcher,
            store_timeout: defaults.store_timeout,
            load_lookup: std::env::var("SWEET_LOAD_LOOKUP")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.load_lookup),
        }
    }
}

/// Why a cycle failed. Parse problems are not here: they never fail a cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    FetchFailed(#[source] FetchError),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("write failed: {0}")]
    WriteFailed(#[source] StoreError),
}

impl CycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::FetchFailed(_) => "fetch_failed",
            CycleError::StoreUnavailable(_) => "store_unavailable",
            CycleError::WriteFailed(_) => "write_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LookupStatus {
    Skipped,
    Loaded { rows: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Unchanged,
    Recorded {
        record: FingerprintRecord,
        entries: usize,
        lookup: LookupStatus,
    },
    /// The change is durably recorded even though the payload did not parse.
    RecordedParseFailed {
        record: FingerprintRecord,
        error: String,
    },
}

impl CycleOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            CycleOutcome::Unchanged => "unchanged",
            CycleOutcome::Recorded { .. } => "recorded",
            CycleOutcome::RecordedParseFailed { .. } => "recorded_parse_failed",
        }
    }

    pub fn record(&self) -> Option<&FingerprintRecord> {
        match self {
            CycleOutcome::Unchanged => None,
            CycleOutcome::Recorded { record, .. } | CycleOutcome::RecordedParseFailed { record, .. } => {
                Some(record)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub url: String,
    pub payload_bytes: usize,
    pub fingerprint: Fingerprint,
    pub outcome: CycleOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub previous: Option<FingerprintRecord>,
    pub changed: bool,
}

/// Decides whether a payload differs from the last one recorded.
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn FingerprintStore>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn FingerprintStore>) -> Self {
        Self { store }
    }

    pub fn fingerprint(&self, payload: &[u8]) -> Fingerprint {
        Fingerprint::of(payload)
    }

    pub async fn compare(&self, fingerprint: &Fingerprint) -> Result<Comparison, StoreError> {
        let previous = self.store.latest_record().await?;
        let changed = previous
            .as_ref()
            .map_or(true, |record| record.fingerprint != *fingerprint);
        Ok(Comparison { previous, changed })
    }

    /// True when the store is empty or its latest fingerprint differs.
    pub async fn has_changed(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self.compare(fingerprint).await?.changed)
    }
}

/// Projects parsed tickers somewhere after a change has been recorded.
#[async_trait]
pub trait LookupLoader: Send + Sync {
    /// `None` means the loader chose not to load anything.
    async fn load(&self, tickers: &[CompanyTicker]) -> Result<Option<u64>, StoreError>;
}

#[derive(Default)]
pub struct NoopLookupLoader;

#[async_trait]
impl LookupLoader for NoopLookupLoader {
    async fn load(&self, _tickers: &[CompanyTicker]) -> Result<Option<u64>, StoreError> {
        Ok(None)
    }
}

/// Replaces the whole `CIK_LOOKUP` table with the latest parsed tickers.
pub struct ReplaceLookupLoader {
    store: Arc<dyn LookupStore>,
}

impl ReplaceLookupLoader {
    pub fn new(store: Arc<dyn LookupStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LookupLoader for ReplaceLookupLoader {
    async fn load(&self, tickers: &[CompanyTicker]) -> Result<Option<u64>, StoreError> {
        self.store.replace_lookup(tickers).await.map(Some)
    }
}

/// Never earlier than the latest recorded timestamp, whatever the clock says.
fn next_recorded_at(previous: Option<&FingerprintRecord>, now: DateTime<Utc>) -> DateTime<Utc> {
    previous.map_or(now, |record| now.max(record.recorded_at))
}

pub struct IngestionPipeline {
    source: Box<dyn DatasetSource>,
    store: Arc<dyn FingerprintStore>,
    detector: ChangeDetector,
    lookup: Box<dyn LookupLoader>,
    // Serializes compare-then-append for cycles sharing this pipeline.
    cycle_lock: Mutex<()>,
}

impl IngestionPipeline {
    pub fn new(source: Box<dyn DatasetSource>, store: Arc<dyn FingerprintStore>) -> Self {
        Self {
            source,
            detector: ChangeDetector::new(store.clone()),
            store,
            lookup: Box::<NoopLookupLoader>::default(),
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn with_lookup_loader(mut self, lookup: Box<dyn LookupLoader>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Runs exactly one ingestion cycle. Nothing is retried.
    pub async fn run_once(&self) -> Result<CycleReport, CycleError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion_cycle", %run_id, url = self.source.url());
        self.run_cycle(run_id).instrument(span).await
    }

    async fn run_cycle(&self, run_id: Uuid) -> Result<CycleReport, CycleError> {
        let _guard = self.cycle_lock.lock().await;
        let started_at = Utc::now();

        self.store.initialize().await.map_err(|err| {
            error!(error = %err, "store initialization failed");
            CycleError::StoreUnavailable(err)
        })?;

        let payload = self.source.fetch().await.map_err(|err| {
            error!(error = %err, "dataset fetch failed; store left untouched");
            CycleError::FetchFailed(err)
        })?;

        let fingerprint = self.detector.fingerprint(&payload);
        info!(%fingerprint, bytes = payload.len(), "payload fingerprinted");

        let comparison = self.detector.compare(&fingerprint).await.map_err(|err| {
            error!(error = %err, "reading latest fingerprint failed");
            CycleError::StoreUnavailable(err)
        })?;

        let report = |outcome: CycleOutcome| CycleReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            url: self.source.url().to_string(),
            payload_bytes: payload.len(),
            fingerprint,
            outcome,
        };

        if !comparison.changed {
            info!("fingerprint matches latest record; nothing to do");
            return Ok(report(CycleOutcome::Unchanged));
        }

        let parsed = parse_company_tickers(&payload);
        if let Err(err) = &parsed {
            warn!(error = %err, "payload did not parse; recording the change anyway");
        }

        let recorded_at = next_recorded_at(comparison.previous.as_ref(), Utc::now());
        let appended = self
            .store
            .append_if_changed(&fingerprint, recorded_at)
            .await
            .map_err(|err| {
                error!(error = %err, "appending fingerprint failed");
                CycleError::WriteFailed(err)
            })?;
        let Some(record) = appended else {
            info!("fingerprint was recorded concurrently; nothing to do");
            return Ok(report(CycleOutcome::Unchanged));
        };
        info!(record_id = record.id, recorded_at = %record.recorded_at, "change recorded");

        let outcome = match parsed {
            Ok(tickers) => {
                let lookup = match self.lookup.load(&tickers).await {
                    Ok(None) => LookupStatus::Skipped,
                    Ok(Some(rows)) => {
                        info!(rows, "lookup table reloaded");
                        LookupStatus::Loaded { rows }
                    }
                    Err(err) => {
                        warn!(error = %err, "lookup load failed; change stays recorded");
                        LookupStatus::Failed {
                            error: err.to_string(),
                        }
                    }
                };
                CycleOutcome::Recorded {
                    record,
                    entries: tickers.len(),
                    lookup,
                }
            }
            Err(err) => CycleOutcome::RecordedParseFailed {
                record,
                error: err.to_string(),
            },
        };

        Ok(report(outcome))
    }
}

pub async fn open_store(config: &SyncConfig) -> Result<Arc<SqliteStore>, StoreError> {
    SqliteStore::open(&config.database_path, config.store_timeout)
        .await
        .map(Arc::new)
}

pub async fn build_pipeline(config: &SyncConfig) -> Result<IngestionPipeline> {
    let store = open_store(config)
        .await
        .with_context(|| format!("opening store {}", config.database_path.display()))?;
    let fetcher = HttpDatasetFetcher::new(config.fetcher.clone())?;

    let mut pipeline = IngestionPipeline::new(Box::new(fetcher), store.clone());
    if config.load_lookup {
        pipeline = pipeline.with_lookup_loader(Box::new(ReplaceLookupLoader::new(store)));
    }
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct ScriptedSource {
        responses: StdMutex<VecDeque<Result<Vec<u8>, FetchError>>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<u8>, FetchError>>) -> Self {
            Self {
                responses: StdMutex::new(responses.into()),
            }
        }

        fn payloads(payloads: &[&[u8]]) -> Self {
            Self::new(payloads.iter().map(|p| Ok(p.to_vec())).collect())
        }
    }

    #[async_trait]
    impl DatasetSource for ScriptedSource {
        fn url(&self) -> &str {
            "scripted://company_tickers.json"
        }

        async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted response left")
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        records: StdMutex<Vec<FingerprintRecord>>,
        fail_appends: AtomicBool,
        fail_reads: AtomicBool,
    }

    impl MemoryStore {
        fn snapshot(&self) -> Vec<FingerprintRecord> {
            self.records.lock().unwrap().clone()
        }

        fn push(&self, fingerprint: &Fingerprint, recorded_at: DateTime<Utc>) -> FingerprintRecord {
            let mut records = self.records.lock().unwrap();
            let record = FingerprintRecord {
                id: records.len() as i64 + 1,
                recorded_at,
                fingerprint: *fingerprint,
            };
            records.push(record.clone());
            record
        }
    }

    #[async_trait]
    impl FingerprintStore for MemoryStore {
        async fn initialize(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn latest_record(&self) -> Result<Option<FingerprintRecord>, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("injected read failure".into()));
            }
            Ok(self.records.lock().unwrap().last().cloned())
        }

        async fn append(
            &self,
            fingerprint: &Fingerprint,
            recorded_at: DateTime<Utc>,
        ) -> Result<FingerprintRecord, StoreError> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StoreError::WriteFailed("injected write failure".into()));
            }
            Ok(self.push(fingerprint, recorded_at))
        }

        async fn append_if_changed(
            &self,
            fingerprint: &Fingerprint,
            recorded_at: DateTime<Utc>,
        ) -> Result<Option<FingerprintRecord>, StoreError> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StoreError::WriteFailed("injected write failure".into()));
            }
            let latest = self.records.lock().unwrap().last().map(|r| r.fingerprint);
            if latest == Some(*fingerprint) {
                return Ok(None);
            }
            Ok(Some(self.push(fingerprint, recorded_at)))
        }

        async fn history(&self, limit: usize) -> Result<Vec<FingerprintRecord>, StoreError> {
            Ok(self.snapshot().into_iter().rev().take(limit).collect())
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LookupLoader for Arc<CountingLoader> {
        async fn load(&self, tickers: &[CompanyTicker]) -> Result<Option<u64>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::WriteFailed("lookup unavailable".into()));
            }
            Ok(Some(tickers.len() as u64))
        }
    }

    const SEC_SAMPLE: &[u8] = br#"{
        "0": {"cik_str": 320193, "ticker": "AAPL", "title": "Apple Inc."},
        "1": {"cik_str": 789019, "ticker": "MSFT", "title": "MICROSOFT CORP"}
    }"#;

    fn pipeline_with(source: ScriptedSource, store: Arc<dyn FingerprintStore>) -> IngestionPipeline {
        IngestionPipeline::new(Box::new(source), store)
    }

    #[tokio::test]
    async fn repeated_payload_is_recorded_once() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let pipeline = pipeline_with(
            ScriptedSource::payloads(&[b"{}", b"{}", br#"{"a":1}"#]),
            store.clone(),
        );

        let first = pipeline.run_once().await.unwrap();
        let record = first.outcome.record().cloned().expect("first cycle records");
        assert_eq!(
            record.fingerprint.to_hex(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
        assert!(matches!(first.outcome, CycleOutcome::Recorded { entries: 0, .. }));

        let second = pipeline.run_once().await.unwrap();
        assert_eq!(second.outcome, CycleOutcome::Unchanged);
        assert_eq!(store.history(10).await.unwrap().len(), 1);

        let third = pipeline.run_once().await.unwrap();
        assert_eq!(third.outcome.kind(), "recorded_parse_failed");
        let history = store.history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_ne!(history[0].fingerprint, history[1].fingerprint);
        assert_eq!(history[1], record);
    }

    #[tokio::test]
    async fn empty_payload_on_empty_store_is_a_change() {
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline_with(ScriptedSource::payloads(&[b""]), store.clone());

        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.payload_bytes, 0);
        assert_eq!(report.fingerprint, Fingerprint::of(b""));
        assert_eq!(report.outcome.kind(), "recorded_parse_failed");
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn history_only_grows_on_transitions() {
        let store = Arc::new(MemoryStore::default());
        let payloads: [&[u8]; 7] = [b"a", b"a", b"b", b"b", b"b", b"a", b"c"];
        let pipeline = pipeline_with(ScriptedSource::payloads(&payloads), store.clone());

        let mut previous = Vec::new();
        for _ in payloads {
            pipeline.run_once().await.unwrap();
            let current = store.snapshot();
            assert!(current.len() >= previous.len());
            assert_eq!(&current[..previous.len()], &previous[..]);
            previous = current;
        }

        let fps: Vec<_> = previous.iter().map(|r| r.fingerprint).collect();
        assert_eq!(
            fps,
            vec![
                Fingerprint::of(b"a"),
                Fingerprint::of(b"b"),
                Fingerprint::of(b"a"),
                Fingerprint::of(b"c"),
            ]
        );
        assert!(previous.windows(2).all(|w| w[0].recorded_at <= w[1].recorded_at));
    }

    #[tokio::test]
    async fn fetch_failure_leaves_store_untouched() {
        let store = Arc::new(MemoryStore::default());
        store.push(&Fingerprint::of(b"old"), Utc::now());
        let pipeline = pipeline_with(
            ScriptedSource::new(vec![Err(FetchError::HttpStatus {
                status: 403,
                url: "scripted://company_tickers.json".into(),
            })]),
            store.clone(),
        );

        let err = pipeline.run_once().await.unwrap_err();
        assert_eq!(err.kind(), "fetch_failed");
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn failed_append_keeps_latest_fingerprint() {
        let store = Arc::new(MemoryStore::default());
        let old = Fingerprint::of(b"old");
        store.push(&old, Utc::now());
        store.fail_appends.store(true, Ordering::SeqCst);
        let pipeline = pipeline_with(ScriptedSource::payloads(&[b"new"]), store.clone());

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, CycleError::WriteFailed(_)));
        assert_eq!(store.latest_fingerprint().await.unwrap(), Some(old));
    }

    #[tokio::test]
    async fn failed_read_is_store_unavailable() {
        let store = Arc::new(MemoryStore::default());
        store.fail_reads.store(true, Ordering::SeqCst);
        let pipeline = pipeline_with(ScriptedSource::payloads(&[b"{}"]), store.clone());

        let err = pipeline.run_once().await.unwrap_err();
        assert_eq!(err.kind(), "store_unavailable");
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn recorded_at_never_goes_backwards() {
        let store = Arc::new(MemoryStore::default());
        let future = Utc.with_ymd_and_hms(2999, 1, 1, 0, 0, 0).single().unwrap();
        store.push(&Fingerprint::of(b"old"), future);
        let pipeline = pipeline_with(ScriptedSource::payloads(&[b"new"]), store.clone());

        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.outcome.record().unwrap().recorded_at, future);
    }

    #[tokio::test]
    async fn concurrent_cycles_record_one_change() {
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline_with(ScriptedSource::payloads(&[b"{}", b"{}"]), store.clone());

        let (a, b) = tokio::join!(pipeline.run_once(), pipeline.run_once());
        let kinds = [a.unwrap().outcome.kind(), b.unwrap().outcome.kind()];
        assert!(kinds.contains(&"recorded"));
        assert!(kinds.contains(&"unchanged"));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn lookup_loader_runs_only_after_recorded_change() {
        let store = Arc::new(MemoryStore::default());
        let loader = Arc::new(CountingLoader::default());
        let pipeline = pipeline_with(ScriptedSource::payloads(&[SEC_SAMPLE, SEC_SAMPLE]), store)
            .with_lookup_loader(Box::new(loader.clone()));

        let first = pipeline.run_once().await.unwrap();
        match first.outcome {
            CycleOutcome::Recorded { entries, lookup, .. } => {
                assert_eq!(entries, 2);
                assert_eq!(lookup, LookupStatus::Loaded { rows: 2 });
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let second = pipeline.run_once().await.unwrap();
        assert_eq!(second.outcome, CycleOutcome::Unchanged);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_failure_does_not_unrecord_change() {
        let store = Arc::new(MemoryStore::default());
        let loader = Arc::new(CountingLoader {
            fail: true,
            ..Default::default()
        });
        let pipeline = pipeline_with(ScriptedSource::payloads(&[SEC_SAMPLE]), store.clone())
            .with_lookup_loader(Box::new(loader));

        let report = pipeline.run_once().await.unwrap();
        assert!(matches!(
            report.outcome,
            CycleOutcome::Recorded {
                lookup: LookupStatus::Failed { .. },
                ..
            }
        ));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn replace_loader_populates_cik_lookup() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let pipeline = pipeline_with(ScriptedSource::payloads(&[SEC_SAMPLE]), store.clone())
            .with_lookup_loader(Box::new(ReplaceLookupLoader::new(store.clone())));

        pipeline.run_once().await.unwrap();
        let rows = store.lookup_entries(10).await.unwrap();
        let tickers: Vec<_> = rows.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["AAPL", "MSFT"]);
    }

    #[tokio::test]
    async fn has_changed_compares_against_latest_only() {
        let store = Arc::new(MemoryStore::default());
        let detector = ChangeDetector::new(store.clone());
        let a = detector.fingerprint(b"a");
        let b = detector.fingerprint(b"b");

        assert!(detector.has_changed(&a).await.unwrap());
        store.push(&a, Utc::now());
        assert!(!detector.has_changed(&a).await.unwrap());
        assert!(detector.has_changed(&b).await.unwrap());
    }

    #[test]
    fn default_config_targets_sec_endpoint() {
        let config = SyncConfig::default();
        assert_eq!(config.database_path, PathBuf::from("src/db/sweet.db"));
        assert_eq!(
            config.fetcher.url,
            "https://www.sec.gov/files/company_tickers.json"
        );
        assert!(!config.load_lookup);
    }
}
