use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pkgsweep::{
    Analyzer, ArchiveTransport, BatchConfig, ConfigError, Cursor, Decision, Downloader,
    FailureRecord, ItemOutcome, PackageListing, PackageRef, ProgressState, RateLimiter,
    RawFailure, RegistryApi, RegistryClient, SpaceProbe, decide, now_epoch_secs,
};
use pkgsweep_store::{LedgerError, OutputManager, ProgressStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::PackageHandler;

/// Errors that stop a run before it starts.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("could not load ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Aborted(String),
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Items that went through the handler.
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Items rejected by the filter criteria.
    pub skipped: u64,
    /// Items the ledger already considered done.
    pub already_done: u64,
    /// Items a dry run would have processed.
    pub planned: Vec<PackageRef>,
    pub elapsed: Duration,
    pub status: RunStatus,
    pub ledger_path: PathBuf,
}

/// Progress notifications for front ends.
#[derive(Debug)]
pub enum BatchEvent<'a> {
    PageListed { page: u32, count: usize },
    Recorded { package: &'a PackageRef, outcome: &'a ItemOutcome },
    AlreadyDone { package: &'a PackageRef },
    Planned { package: &'a PackageRef },
}

type Observer = Box<dyn Fn(BatchEvent<'_>) + Send + Sync>;

#[derive(Default)]
struct Tally {
    processed: u64,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    already_done: u64,
    planned: Vec<PackageRef>,
    /// Items counted against the limit.
    recorded: usize,
}

impl Tally {
    fn add(&mut self, outcome: &ItemOutcome) {
        self.recorded += 1;
        match outcome {
            ItemOutcome::Succeeded { .. } => {
                self.processed += 1;
                self.succeeded += 1;
            }
            ItemOutcome::Failed(_) => {
                self.processed += 1;
                self.failed += 1;
            }
            ItemOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

/// What the per-item step tells the page loop.
enum Step {
    /// The ledger changed.
    Recorded,
    /// Nothing was written: already done, or a dry run.
    Untouched,
    Stop(RunStatus),
}

/// Drives a whole run: pages through the catalog and folds each listing
/// into the ledger.
pub struct BatchProcessor {
    config: Arc<BatchConfig>,
    registry: RegistryClient,
    handler: PackageHandler,
    output: OutputManager,
    store: ProgressStore,
    cancel: CancellationToken,
    observer: Option<Observer>,
}

impl BatchProcessor {
    pub fn new(
        config: BatchConfig,
        registry: Arc<dyn RegistryApi>,
        transport: Arc<dyn ArchiveTransport>,
        analyzer: Arc<dyn Analyzer>,
        probe: Arc<dyn SpaceProbe>,
    ) -> Result<Self, BatchError> {
        config.validate()?;
        let config = Arc::new(config);

        let limiter = Arc::new(RateLimiter::new(config.api_delay, config.download_delay));
        let registry = RegistryClient::new(registry, limiter.clone(), config.sort)
            .with_retry(config.max_list_attempts, config.throttle_backoff);
        let downloader =
            Downloader::new(transport, limiter).with_max_bytes(config.max_uncompressed_bytes);
        let handler = PackageHandler::new(config.clone(), downloader, analyzer);
        let output = OutputManager::new(&config.output_dir, config.min_free_bytes, probe);
        let store = ProgressStore::new(config.ledger_path());

        Ok(Self {
            config,
            registry,
            handler,
            output,
            store,
            cancel: CancellationToken::new(),
            observer: None,
        })
    }

    /// Use `token` as the stop signal. It is observed between items.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn on_event(mut self, observer: impl Fn(BatchEvent<'_>) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    fn emit(&self, event: BatchEvent<'_>) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }

    /// Run the batch to completion, cancellation or abort.
    ///
    /// Only startup problems (configuration, unreadable ledger) are returned
    /// as errors. Everything after that ends in a [`BatchResult`].
    pub async fn run(&self) -> Result<BatchResult, BatchError> {
        let started = Instant::now();
        let config = &self.config;
        config.validate()?;

        // Resumed runs still walk from `start_page`; settled entries fall out
        // as `AlreadyDone` in `decide` without touching the network.
        let mut state = self.store.load(config.resume)?;
        let mut page = config.start_page;
        info!(
            registry = self.registry.label(),
            page,
            resume = config.resume,
            last_cursor = ?state.cursor(),
            dry_run = config.dry_run,
            known = state.len(),
            "starting batch"
        );

        let mut tally = Tally::default();
        let mut since_checkpoint = 0;

        let status = 'pages: loop {
            if self.cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }
            if self.limit_reached(&tally) {
                break RunStatus::Completed;
            }

            let listings = match self.registry.list_page(page).await {
                Ok(listings) => listings,
                Err(e) => {
                    error!(page, error = %e, "catalog listing failed");
                    break RunStatus::Aborted(format!("listing page {page} failed: {e}"));
                }
            };
            if listings.is_empty() {
                info!(page, "catalog exhausted");
                break RunStatus::Completed;
            }
            self.emit(BatchEvent::PageListed {
                page,
                count: listings.len(),
            });

            for (index, listing) in listings.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    break 'pages RunStatus::Cancelled;
                }
                if self.limit_reached(&tally) {
                    break 'pages RunStatus::Completed;
                }

                let cursor = Cursor { page, index };
                match self
                    .process_listing(listing, cursor, &mut state, &mut tally)
                    .await
                {
                    Step::Stop(status) => break 'pages status,
                    Step::Untouched => {}
                    Step::Recorded => {
                        since_checkpoint += 1;
                        if since_checkpoint >= config.checkpoint_every {
                            since_checkpoint = 0;
                            if let Err(e) = self.store.checkpoint(&state) {
                                error!(error = %e, "ledger checkpoint failed");
                                break 'pages RunStatus::Aborted(format!("ledger write failed: {e}"));
                            }
                            debug!(entries = state.len(), "checkpoint written");
                        }
                    }
                }
            }

            page += 1;
        };

        let status = self.finish(&state, status);
        let result = BatchResult {
            processed: tally.processed,
            succeeded: tally.succeeded,
            failed: tally.failed,
            skipped: tally.skipped,
            already_done: tally.already_done,
            planned: tally.planned,
            elapsed: started.elapsed(),
            status,
            ledger_path: self.store.path().to_path_buf(),
        };
        info!(
            status = %result.status,
            processed = result.processed,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            already_done = result.already_done,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "batch finished"
        );
        Ok(result)
    }

    fn limit_reached(&self, tally: &Tally) -> bool {
        self.config.limit.is_some_and(|limit| tally.recorded >= limit)
    }

    /// Write the final checkpoint. A failure here turns a clean finish into an abort.
    fn finish(&self, state: &ProgressState, status: RunStatus) -> RunStatus {
        if self.config.dry_run {
            return status;
        }
        match self.store.checkpoint(state) {
            Ok(()) => status,
            Err(e) => {
                error!(error = %e, "final ledger checkpoint failed");
                match status {
                    RunStatus::Aborted(reason) => RunStatus::Aborted(reason),
                    _ => RunStatus::Aborted(format!("ledger write failed: {e}")),
                }
            }
        }
    }

    async fn process_listing(
        &self,
        listing: &PackageListing,
        cursor: Cursor,
        state: &mut ProgressState,
        tally: &mut Tally,
    ) -> Step {
        let package = &listing.package;

        let outcome = match decide(listing, state, &self.config) {
            Decision::SkipAlreadyDone => {
                debug!(package = %package, "already done");
                tally.already_done += 1;
                self.emit(BatchEvent::AlreadyDone { package });
                return Step::Untouched;
            }
            Decision::SkipCriteria(reason) => {
                debug!(package = %package, reason = %reason, "skipped by criteria");
                ItemOutcome::Skipped(reason)
            }
            Decision::Keep if self.config.dry_run => {
                tally.recorded += 1;
                tally.planned.push(package.clone());
                self.emit(BatchEvent::Planned { package });
                return Step::Untouched;
            }
            Decision::Keep => {
                if let Err(e) = self.output.check_disk_space() {
                    error!(package = %package, error = %e, "disk check failed");
                    return Step::Stop(RunStatus::Aborted(e.to_string()));
                }

                let attempt = state.attempts(package) + 1;
                if let Err(e) = self.output.package_dir(package) {
                    let raw = RawFailure::UnsafeOutputPath(e.to_string());
                    let record = FailureRecord::from_raw(package.clone(), &raw, attempt);
                    self.record(package, cursor, ItemOutcome::Failed(record), state, tally);
                    return Step::Recorded;
                }
                state.mark_pending(package, now_epoch_secs());

                match self.handler.process(listing, attempt).await {
                    Ok(analysis) => match self.output.write(package, &analysis) {
                        Ok(dir) => ItemOutcome::Succeeded { output: dir },
                        Err(e) => {
                            let record = FailureRecord::from_raw(
                                package.clone(),
                                &RawFailure::Output(e.to_string()),
                                attempt,
                            );
                            if e.is_fatal() {
                                let outcome = ItemOutcome::Failed(record);
                                self.record(package, cursor, outcome, state, tally);
                                return Step::Stop(RunStatus::Aborted(e.to_string()));
                            }
                            ItemOutcome::Failed(record)
                        }
                    },
                    Err(record) => ItemOutcome::Failed(record),
                }
            }
        };

        // Only criteria skips reach this point in a dry run.
        if self.config.dry_run {
            tally.add(&outcome);
            self.emit(BatchEvent::Recorded {
                package,
                outcome: &outcome,
            });
            return Step::Untouched;
        }

        self.record(package, cursor, outcome, state, tally);
        Step::Recorded
    }

    fn record(
        &self,
        package: &PackageRef,
        cursor: Cursor,
        outcome: ItemOutcome,
        state: &mut ProgressState,
        tally: &mut Tally,
    ) {
        match &outcome {
            ItemOutcome::Succeeded { output } => {
                info!(package = %package, output = %output.display(), "item succeeded")
            }
            ItemOutcome::Failed(record) => warn!(
                package = %package,
                kind = %record.kind,
                retryable = record.retryable,
                attempt = record.attempt,
                message = %record.message,
                "item failed"
            ),
            ItemOutcome::Skipped(reason) => info!(package = %package, reason = %reason, "item skipped"),
        }

        state.record(package, cursor, &outcome, now_epoch_secs());
        tally.add(&outcome);
        self.emit(BatchEvent::Recorded {
            package,
            outcome: &outcome,
        });
    }
}
