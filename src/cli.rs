use crate::utils::{format_bytes, format_duration, output_file_name, validate_url};
use crate::{Config, Metrics, PowerLevel, RenderOutcome, RenderRequest, RenderService, RunMode};
use crate::{TransformPool, TransformSettings};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "prerender")]
#[command(about = "Headless-browser pre-render service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Render timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Number of long-lived browser processes")]
    pub pool_size: Option<usize>,

    #[arg(long, global = true, help = "Run mode (development, production)")]
    pub mode: Option<RunMode>,

    #[arg(long, global = true, help = "Rewriting power level (1, 2, 3)")]
    pub power_level: Option<PowerLevel>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Render a single URL
    Render {
        #[arg(short, long, help = "URL to render")]
        url: String,

        #[arg(
            long,
            default_value = "1",
            help = "Render this many times; later runs may be served from the cache"
        )]
        repeat: usize,

        #[arg(short, long, help = "Write the rendered markup to this file")]
        output: Option<PathBuf>,
    },

    /// Render every URL listed in a file
    Batch {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(short, long, help = "Output directory for rendered markup")]
        output: PathBuf,
    },

    /// Run the markup transforms on a local file
    Optimize {
        #[arg(short, long, help = "HTML file to transform")]
        input: PathBuf,

        #[arg(short, long, help = "Output file (defaults to stdout)")]
        output: Option<PathBuf>,

        #[arg(long, help = "Apply the full optimization rule set")]
        full: bool,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Apply flag overrides on top of a file or default configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(timeout) = self.timeout {
            config.render_timeout = Duration::from_secs(timeout);
        }
        if let Some(pool_size) = self.pool_size {
            config.browser_pool_size = pool_size;
        }
        if let Some(mode) = self.mode {
            config.run_mode = mode;
        }
        if let Some(power_level) = self.power_level {
            config.power_level = power_level;
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
    }

    pub async fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => Config::default(),
        };

        self.apply_overrides(&mut config);
        config.validate()?;

        info!("Configuration loaded successfully");
        info!("Render timeout: {:?}", config.render_timeout);
        info!("Browser pool size: {}", config.browser_pool_size);
        info!("Power level: {:?}, run mode: {:?}", config.power_level, config.run_mode);

        Ok(config)
    }
}

pub struct CliRunner {
    pub config: Config,
    metrics: Arc<Metrics>,
    service: OnceCell<RenderService>,
}

impl CliRunner {
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            metrics,
            service: OnceCell::new(),
        }
    }

    /// The render service, launched on first use so commands that never
    /// render don't need a browser.
    async fn service(&self) -> anyhow::Result<&RenderService> {
        let service = self
            .service
            .get_or_try_init(|| RenderService::from_config(self.config.clone(), self.metrics.clone()))
            .await?;
        Ok(service)
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Render {
                url,
                repeat,
                output,
            } => self.run_render(url, repeat, output).await,
            Commands::Batch { input, output } => self.run_batch(&input, &output).await,
            Commands::Optimize {
                input,
                output,
                full,
            } => self.run_optimize(&input, output.as_deref(), full).await,
            Commands::Validate { config } => self.validate_config(&config).await,
        }
    }

    pub async fn run_render(
        &self,
        url: String,
        repeat: usize,
        output: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        validate_url(&url).with_context(|| format!("invalid URL: {url}"))?;
        let service = self.service().await?;

        let mut last = None;
        for attempt in 0..repeat.max(1) {
            let started = Instant::now();
            let outcome = service.render(RenderRequest::new(url.clone(), attempt == 0)).await;
            println!(
                "Render {}: {} in {}",
                attempt + 1,
                describe_outcome(outcome.as_ref()),
                format_duration(started.elapsed())
            );
            if outcome.is_some() {
                last = outcome;
            }
        }

        let Some(outcome) = last else {
            bail!("no result for {url}");
        };
        let result = outcome.into_result();

        match output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&path, &result.html).await?;
                println!(
                    "Saved {} ({}) to {}",
                    url,
                    format_bytes(result.html.len()),
                    path.display()
                );
            }
            None => println!("{}", result.html),
        }

        Ok(())
    }

    pub async fn run_batch(&self, input: &Path, output: &Path) -> anyhow::Result<()> {
        info!("Starting batch render");

        let urls = read_urls_from_file(input).await?;
        info!("Loaded {} URLs from {}", urls.len(), input.display());
        fs::create_dir_all(output).await?;

        let service = self.service().await?;
        let started = Instant::now();
        let results = service.render_urls(urls).await;

        let mut success_count = 0;
        let mut error_count = 0;
        for (url, outcome) in results {
            match outcome {
                Some(outcome) => {
                    let result = outcome.result();
                    let path = output.join(output_file_name(&url));
                    fs::write(&path, &result.html).await?;
                    success_count += 1;
                    info!("Saved {} ({}) to {}", url, result.status, path.display());
                }
                None => {
                    error_count += 1;
                    warn!("No result for {}", url);
                }
            }
        }

        let stats = service.cache().get_stats();
        info!(
            "Batch finished in {}. Success: {}, Errors: {}, Cached entries: {}",
            format_duration(started.elapsed()),
            success_count,
            error_count,
            stats.entries
        );
        Ok(())
    }

    pub async fn run_optimize(
        &self,
        input: &Path,
        output: Option<&Path>,
        full: bool,
    ) -> anyhow::Result<()> {
        let html = fs::read_to_string(input)
            .await
            .with_context(|| format!("reading {}", input.display()))?;

        let transforms = TransformPool::new(1, TransformSettings::from(&self.config))?;
        let compressed = transforms.compress(html.as_str()).await?;
        let optimized = transforms.optimize(compressed, full).await?;
        tokio::task::spawn_blocking(move || transforms.shutdown()).await?;

        info!(
            "Transformed {}: {} -> {}",
            input.display(),
            format_bytes(html.len()),
            format_bytes(optimized.len())
        );

        match output {
            Some(path) => fs::write(path, optimized).await?,
            None => println!("{optimized}"),
        }
        Ok(())
    }

    pub async fn validate_config(&self, config_path: &Path) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = Config::load(config_path).await?;

        println!("Configuration is valid:");
        println!("  Render timeout: {:?}", config.render_timeout);
        println!("  Power level: {:?}", config.power_level);
        println!("  Bandwidth level: {:?}", config.bandwidth_level);
        println!("  Run mode: {:?}", config.run_mode);
        println!("  Browser pool size: {}", config.browser_pool_size);
        println!("  Isolated profiles: {}", config.isolated_profiles);
        println!("  Cacheable statuses: {:?}", config.cacheable_status_codes);

        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(service) = self.service.get() {
            service.shutdown().await;
        }
    }
}

fn describe_outcome(outcome: Option<&RenderOutcome>) -> String {
    match outcome {
        Some(RenderOutcome::Cached(result)) => format!("cached ({})", result.status),
        Some(RenderOutcome::FallbackServed(result)) => {
            format!("served from cache ({})", result.status)
        }
        Some(RenderOutcome::PassThrough(result)) => format!("passed through ({})", result.status),
        None => "no result".to_string(),
    }
}

pub async fn read_urls_from_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let urls = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    Ok(urls)
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}
