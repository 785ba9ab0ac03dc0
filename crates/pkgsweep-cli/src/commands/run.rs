use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use pkgsweep::{
    AnalysisError, AnalysisOutput, Analyzer, BatchConfig, ItemOutcome, PackageRef, SortOrder,
};
use pkgsweep_pipeline::{BatchEvent, BatchProcessor, BatchResult, RunStatus};
use pkgsweep_registry::{HexRegistry, HexRegistryConfig, HttpArchiveTransport};
use pkgsweep_store::SystemSpaceProbe;
use tracing::{debug, warn};

use crate::analyzer::CommandAnalyzer;
use crate::config::{AnalyzerSection, BatchSection, FileConfig, RegistrySection};

#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Directory for analysis output and the ledger
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Scratch directory for per-package workspaces
    #[arg(long)]
    temp_root: Option<PathBuf>,
    /// Ledger file (defaults to <output>/progress.json)
    #[arg(long)]
    ledger: Option<PathBuf>,
    /// Stop after this many packages have been recorded
    #[arg(long)]
    limit: Option<usize>,
    /// First catalog page to request
    #[arg(long)]
    start_page: Option<u32>,
    /// Minimum gap between registry API calls, in milliseconds
    #[arg(long)]
    api_delay_ms: Option<u64>,
    /// Minimum gap between archive downloads, in milliseconds
    #[arg(long)]
    download_delay_ms: Option<u64>,
    /// Wall-clock budget per package, in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Continue from the existing ledger
    #[arg(long)]
    resume: bool,
    /// List and filter only; download nothing and write nothing
    #[arg(long)]
    dry_run: bool,
    /// Reprocess packages the ledger already considers done
    #[arg(long)]
    force: bool,
    /// Catalog order (name, inserted_at, updated_at, total_downloads, recent_downloads)
    #[arg(long)]
    sort: Option<String>,
    /// Attempts allowed across runs for a retryable failure
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Abort when the output volume has less free space than this
    #[arg(long)]
    min_free_bytes: Option<u64>,
    /// Only analyze packages built with one of these tools (repeatable)
    #[arg(long = "require-build-tool")]
    required_build_tools: Vec<String>,
    /// Package names to leave out (repeatable)
    #[arg(long)]
    exclude: Vec<String>,
    /// Leave out retired releases
    #[arg(long)]
    skip_retired: bool,
    /// File extensions that count as analyzable source (repeatable)
    #[arg(long = "source-ext")]
    source_extensions: Vec<String>,
    /// Registry API base URL
    #[arg(long)]
    api_url: Option<String>,
    /// Registry repository base URL for tarballs
    #[arg(long)]
    repo_url: Option<String>,
    /// Analyzer program; its arguments follow `--`
    #[arg(long)]
    analyzer: Option<String>,
    #[arg(last = true)]
    analyzer_args: Vec<String>,
}

impl RunArgs {
    /// Merge flags over the `[batch]` table and validate the result.
    pub fn batch_config(&self, file: &BatchSection) -> Result<BatchConfig> {
        let output = self
            .output
            .clone()
            .or_else(|| file.output_dir.clone())
            .context("no output directory: pass --output or set batch.output_dir")?;

        let mut builder = BatchConfig::builder(output)
            .limit(self.limit.or(file.limit))
            .resume(self.resume || file.resume.unwrap_or(false))
            .force(self.force || file.force.unwrap_or(false))
            .skip_retired(self.skip_retired || file.skip_retired.unwrap_or(false))
            .dry_run(self.dry_run)
            .required_build_tools(pick(&self.required_build_tools, &file.required_build_tools))
            .exclude(pick(&self.exclude, &file.exclude))
            .source_extensions(pick(&self.source_extensions, &file.source_extensions));

        if let Some(path) = self.temp_root.clone().or_else(|| file.temp_root.clone()) {
            builder = builder.temp_root(path);
        }
        if let Some(path) = self.ledger.clone().or_else(|| file.ledger_path.clone()) {
            builder = builder.ledger_path(path);
        }
        if let Some(page) = self.start_page.or(file.start_page) {
            builder = builder.start_page(page);
        }
        if let Some(ms) = self.api_delay_ms.or(file.api_delay_ms) {
            builder = builder.api_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.download_delay_ms.or(file.download_delay_ms) {
            builder = builder.download_delay(Duration::from_millis(ms));
        }
        if let Some(secs) = self.timeout_secs.or(file.item_timeout_secs) {
            builder = builder.item_timeout(Duration::from_secs(secs));
        }
        if let Some(sort) = self.sort.as_deref().or(file.sort.as_deref()) {
            builder = builder.sort(SortOrder::parse(sort)?);
        }
        if let Some(attempts) = self.max_attempts.or(file.max_attempts) {
            builder = builder.max_attempts(attempts);
        }
        if let Some(attempts) = file.max_list_attempts {
            builder = builder.max_list_attempts(attempts);
        }
        if let Some(every) = file.checkpoint_every {
            builder = builder.checkpoint_every(every);
        }
        if let Some(ms) = file.throttle_backoff_ms {
            builder = builder.throttle_backoff(Duration::from_millis(ms));
        }
        if let Some(bytes) = self.min_free_bytes.or(file.min_free_bytes) {
            builder = builder.min_free_bytes(bytes);
        }
        if let Some(bytes) = file.max_uncompressed_bytes {
            builder = builder.max_uncompressed_bytes(bytes);
        }

        builder.build().context("invalid batch configuration")
    }

    fn registry_config(&self, file: &RegistrySection) -> HexRegistryConfig {
        HexRegistryConfig {
            api_base_url: self.api_url.clone().or_else(|| file.api_url.clone()),
            repo_base_url: self.repo_url.clone().or_else(|| file.repo_url.clone()),
            user_agent: file.user_agent.clone(),
        }
    }

    fn analyzer(&self, file: &AnalyzerSection, dry_run: bool) -> Result<Arc<dyn Analyzer>> {
        let (program, args) = match &self.analyzer {
            Some(program) => (Some(program.clone()), self.analyzer_args.clone()),
            None => (file.command.clone(), file.args.clone()),
        };
        match program {
            Some(program) => Ok(Arc::new(CommandAnalyzer::new(program, args))),
            None if dry_run => Ok(Arc::new(Unconfigured)),
            None => bail!("no analyzer configured: pass --analyzer or set analyzer.command"),
        }
    }
}

/// Flags replace the file's list rather than extending it.
fn pick(flag: &[String], file: &Option<Vec<String>>) -> Vec<String> {
    if flag.is_empty() {
        file.clone().unwrap_or_default()
    } else {
        flag.to_vec()
    }
}

/// Stand-in for dry runs, which never reach analysis.
struct Unconfigured;

impl Analyzer for Unconfigured {
    fn name(&self) -> &str {
        "unconfigured"
    }

    fn analyze(&self, _root: &std::path::Path, _package: &PackageRef) -> Result<AnalysisOutput, AnalysisError> {
        Err(AnalysisError::Failed("no analyzer configured".into()))
    }
}

pub async fn run(args: RunArgs, file: FileConfig) -> Result<()> {
    let config = args.batch_config(&file.batch)?;
    let dry_run = config.dry_run;
    let analyzer = args.analyzer(&file.analyzer, dry_run)?;
    let registry = HexRegistry::new(args.registry_config(&file.registry));
    let transport = HttpArchiveTransport::new(file.registry.user_agent.clone());

    let recorded = AtomicU64::new(0);
    let processor = BatchProcessor::new(
        config,
        Arc::new(registry),
        Arc::new(transport),
        analyzer,
        Arc::new(SystemSpaceProbe),
    )?
    .on_event(move |event| print_event(&recorded, event));

    let token = processor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current package");
            token.cancel();
        }
    });

    let result = processor.run().await.context("batch could not start")?;
    print_summary(&result, dry_run);

    if let RunStatus::Aborted(reason) = &result.status {
        bail!("run aborted: {reason}");
    }
    Ok(())
}

fn print_event(recorded: &AtomicU64, event: BatchEvent<'_>) {
    match event {
        BatchEvent::PageListed { page, count } => debug!(page, count, "page listed"),
        BatchEvent::AlreadyDone { package } => debug!(package = %package, "already done"),
        BatchEvent::Planned { package } => println!("[plan ] {package}"),
        BatchEvent::Recorded { package, outcome } => {
            let n = recorded.fetch_add(1, Ordering::Relaxed) + 1;
            println!("[{n:>5}] {}", describe(package, outcome));
        }
    }
}

fn describe(package: &PackageRef, outcome: &ItemOutcome) -> String {
    match outcome {
        ItemOutcome::Succeeded { .. } => format!("{package}  ok"),
        ItemOutcome::Failed(record) => {
            let retry = if record.retryable { ", will retry" } else { "" };
            format!("{package}  failed ({}{retry}): {}", record.kind, record.message)
        }
        ItemOutcome::Skipped(reason) => format!("{package}  skipped ({reason})"),
    }
}

fn print_summary(result: &BatchResult, dry_run: bool) {
    println!();
    println!("Run {} in {:.1}s", result.status, result.elapsed.as_secs_f64());
    if dry_run {
        println!("  planned       {}", result.planned.len());
        println!("  skipped       {}", result.skipped);
    } else {
        println!("  processed     {}", result.processed);
        println!("  succeeded     {}", result.succeeded);
        println!("  failed        {}", result.failed);
        println!("  skipped       {}", result.skipped);
        println!("  ledger        {}", result.ledger_path.display());
    }
    println!("  already done  {}", result.already_done);
}
