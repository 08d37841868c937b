use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;

use reverse_prompt::store::{count_by_status, read_store};
use reverse_prompt::{
    discover::parse_extensions, open_store, prepare, read_image, BatchConfig, BatchRunner,
    BatchSummary, CaptionComposer, CaptionRules, Captioner, GeminiCaptioner, GeminiConfig,
    ImageSource, OllamaCaptioner, OllamaConfig, PrepareOptions, RecordStatus, TermDictionary,
};

/// Generate reverse prompts for image datasets and prepare LoRA training sets.
#[derive(Parser)]
#[command(name = "reverse-prompt", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Caption every image not yet done in the progress store.
    Run(RunArgs),
    /// Caption a single image and print the result.
    Probe(ProbeArgs),
    /// Summarize a progress store.
    Status(StatusArgs),
    /// Build caption + image pairs from a metadata CSV.
    Prepare(PrepareArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Provider {
    Gemini,
    Ollama,
}

#[derive(Args)]
struct BackendArgs {
    #[arg(long, value_enum, default_value = "gemini")]
    provider: Provider,

    /// API root (default depends on the provider).
    #[arg(long)]
    endpoint: Option<String>,

    /// Model name [default: gemini-2.5-flash-lite, or llava for ollama]
    #[arg(long)]
    model: Option<String>,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Instruction sent with every image.
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,

    /// Read the instruction from a file.
    #[arg(long)]
    prompt_file: Option<PathBuf>,

    /// Per-call timeout in seconds.
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    backend: BackendArgs,

    /// Directory to scan recursively for images.
    #[arg(long, required_unless_present = "manifest", conflicts_with = "manifest")]
    input: Option<PathBuf>,

    /// Text file with one image path per line.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Progress store (.csv, or .db/.sqlite/.sqlite3 for SQLite).
    #[arg(long, default_value = "reverse_prompts.csv")]
    output: PathBuf,

    /// Comma-separated extensions to pick up in --input mode.
    #[arg(long)]
    extensions: Option<String>,

    /// Total calls per image, including the first.
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    #[arg(long, default_value_t = 2000)]
    base_delay_ms: u64,

    #[arg(long, default_value_t = 2.0)]
    backoff_multiplier: f64,

    #[arg(long, default_value_t = 60_000)]
    max_delay_ms: u64,

    /// Randomize backoff waits.
    #[arg(long)]
    jitter: bool,

    /// Pause between images.
    #[arg(long, default_value_t = 200)]
    pace_ms: u64,

    /// Also write the run summary as JSON.
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

#[derive(Args)]
struct ProbeArgs {
    #[command(flatten)]
    backend: BackendArgs,

    image: PathBuf,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long, default_value = "reverse_prompts.csv")]
    output: PathBuf,

    /// List failed images with their last error.
    #[arg(long)]
    failed: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct PrepareArgs {
    #[arg(long, default_value = "./dataset/metadata.csv")]
    input_csv: PathBuf,

    /// Root folder of the source images.
    #[arg(long, default_value = "./dataset/images")]
    images: PathBuf,

    #[arg(long, default_value = "./training_data")]
    out: PathBuf,

    /// Term dictionary JSON: {"Term": [weight, ["synonym", ...]]}
    #[arg(long)]
    terms: Option<PathBuf>,

    #[arg(long, default_value = "file_name")]
    file_col: String,

    #[arg(long, default_value = "triage")]
    triage_col: String,

    #[arg(long, default_value_t = 1.0)]
    min_style: f64,

    #[arg(long, default_value_t = 1.0)]
    min_quality: f64,

    /// Keep rows whose COLUMN contains one of the values, e.g.
    /// `--filter category=portrait,landscape`. Repeatable.
    #[arg(long = "filter", value_name = "COLUMN=VALUES", value_parser = parse_filter)]
    filters: Vec<(String, Vec<String>)>,

    #[arg(long)]
    trigger_word: Option<String>,

    #[arg(long)]
    mandatory_concept: Option<String>,

    /// Keep only rows that mention a dictionary term.
    #[arg(long)]
    require_match: bool,

    /// Report what would be written without touching the output directory.
    #[arg(long)]
    dry_run: bool,
}

fn parse_filter(raw: &str) -> Result<(String, Vec<String>), String> {
    let (column, values) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected COLUMN=VALUES, got {raw:?}"))?;
    let column = column.trim();
    if column.is_empty() {
        return Err(format!("missing column name in {raw:?}"));
    }
    let values = values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    Ok((column.to_string(), values))
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Probe(args) => probe(args).await,
        Command::Status(args) => status(args),
        Command::Prepare(args) => prepare_dataset(args),
    }
}

// ── Backends ──

fn resolve_prompt(args: &BackendArgs) -> Result<Option<String>> {
    if let Some(path) = &args.prompt_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt file {}", path.display()))?;
        return Ok(Some(text.trim().to_string()));
    }
    Ok(args.prompt.clone())
}

fn gemini(args: &BackendArgs) -> Result<GeminiCaptioner> {
    let mut config = GeminiConfig::with_api_key(args.api_key.clone().unwrap_or_default())
        .timeout(Duration::from_secs(args.timeout_secs));
    if let Some(endpoint) = &args.endpoint {
        config = config.endpoint(endpoint.as_str());
    }
    if let Some(model) = &args.model {
        config = config.model(model.as_str());
    }
    if let Some(prompt) = resolve_prompt(args)? {
        config = config.prompt(prompt);
    }
    Ok(GeminiCaptioner::new(config)?)
}

fn ollama(args: &BackendArgs) -> Result<OllamaCaptioner> {
    let mut config = OllamaConfig::default().timeout(Duration::from_secs(args.timeout_secs));
    if let Some(endpoint) = &args.endpoint {
        config = config.endpoint(endpoint.as_str());
    }
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(prompt) = resolve_prompt(args)? {
        config = config.prompt(prompt);
    }
    Ok(OllamaCaptioner::new(config))
}

// ── run ──

async fn run(args: RunArgs) -> Result<()> {
    let summary = match args.backend.provider {
        Provider::Gemini => run_batch(gemini(&args.backend)?, &args).await?,
        Provider::Ollama => run_batch(ollama(&args.backend)?, &args).await?,
    };

    println!("Run {}", summary.run_id);
    println!("  discovered:    {}", summary.discovered);
    println!("  skipped:       {}", summary.skipped);
    println!("  done:          {}", summary.done);
    println!("  failed:        {}", summary.failed);
    println!("  not attempted: {}", summary.not_attempted);
    println!("  API calls:     {}", summary.api_calls);

    if let Some(path) = &args.summary_json {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    }
    Ok(())
}

async fn run_batch<C: Captioner>(captioner: C, args: &RunArgs) -> Result<BatchSummary> {
    let config = BatchConfig::builder()
        .with_max_attempts(args.max_attempts)
        .with_base_delay(Duration::from_millis(args.base_delay_ms))
        .with_backoff_multiplier(args.backoff_multiplier)
        .with_max_delay(Duration::from_millis(args.max_delay_ms))
        .with_jitter(args.jitter)
        .with_call_timeout(Duration::from_secs(args.backend.timeout_secs))
        .with_pace(Duration::from_millis(args.pace_ms))
        .build();
    let runner = BatchRunner::new(captioner, config)?;

    let source = match (&args.input, &args.manifest) {
        (_, Some(manifest)) => ImageSource::Manifest(manifest.clone()),
        (Some(root), None) => match &args.extensions {
            Some(list) => ImageSource::Directory {
                root: root.clone(),
                extensions: parse_extensions(list),
            },
            None => ImageSource::directory(root),
        },
        (None, None) => bail!("either --input or --manifest is required"),
    };
    let records = source.discover()?;

    let mut store = open_store(&args.output)
        .with_context(|| format!("Failed to open progress store {}", args.output.display()))?;

    let cancel = runner.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Interrupt received, stopping after the current image (press again to abort)");
        cancel.store(true, Ordering::SeqCst);
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    Ok(runner.run(&records, store.as_mut()).await?)
}

// ── probe ──

async fn probe(args: ProbeArgs) -> Result<()> {
    let caption = match args.backend.provider {
        Provider::Gemini => probe_one(gemini(&args.backend)?, &args.image).await?,
        Provider::Ollama => probe_one(ollama(&args.backend)?, &args.image).await?,
    };
    println!("{caption}");
    Ok(())
}

async fn probe_one<C: Captioner>(captioner: C, image: &Path) -> Result<String> {
    let payload = read_image(image)?;
    tracing::info!(
        "Probing {} ({} bytes) with {}",
        image.display(),
        payload.bytes.len(),
        captioner.model()
    );
    let caption = captioner
        .caption(&payload)
        .await
        .with_context(|| format!("Captioning {} failed", image.display()))?;
    Ok(caption)
}

// ── status ──

fn status(args: StatusArgs) -> Result<()> {
    if !args.output.exists() {
        bail!("no progress store at {}", args.output.display());
    }
    let entries = read_store(&args.output)
        .with_context(|| format!("Failed to read progress store {}", args.output.display()))?;
    let counts = count_by_status(&entries);
    let failed: Vec<_> = entries
        .iter()
        .filter(|e| e.status == RecordStatus::Failed)
        .collect();

    if args.json {
        let failed_json: Vec<_> = failed
            .iter()
            .map(|e| json!({ "id": e.id, "attempts": e.attempts, "error": e.error }))
            .collect();
        let report = json!({
            "store": args.output,
            "total": entries.len(),
            "counts": counts,
            "failed": if args.failed { failed_json } else { Vec::new() },
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{} ({} entries)", args.output.display(), entries.len());
    for (status, count) in &counts {
        println!("  {status:<12} {count}");
    }
    if args.failed {
        for entry in failed {
            println!(
                "  ! {} [{} attempt(s)]: {}",
                entry.id,
                entry.attempts,
                entry.error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

// ── prepare ──

fn prepare_dataset(args: PrepareArgs) -> Result<()> {
    let dictionary = match &args.terms {
        Some(path) => TermDictionary::load(path)?,
        None => TermDictionary::empty(),
    };
    if args.require_match && dictionary.is_empty() {
        bail!("--require-match needs a non-empty --terms dictionary");
    }

    let rules = CaptionRules {
        trigger_word: args.trigger_word.clone(),
        mandatory_concept: args.mandatory_concept.clone(),
        ..CaptionRules::default()
    };
    let composer = CaptionComposer::new(rules, dictionary)?;

    let mut options = PrepareOptions::new(&args.input_csv, &args.images, &args.out);
    options.file_column = args.file_col;
    options.triage_column = args.triage_col;
    options.min_style = args.min_style;
    options.min_quality = args.min_quality;
    options.extra_filters = args.filters;
    options.require_match = args.require_match;
    options.dry_run = args.dry_run;

    let report = prepare(&options, &composer)?;
    println!("{}", serde_json::to_string_pretty(&report.counts)?);
    if args.dry_run {
        println!("(dry run; no files written)");
    }
    Ok(())
}
