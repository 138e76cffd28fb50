//! Command definitions for the `routewise` binary.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use routewise_core::{classify_with, estimate_tokens, Catalog, CostMode, RequestContext};
use routewise_runtime::{
    CompletionResponse, ProviderError, ResilienceOrchestrator, RuntimeConfig, RuntimeError,
    TokenUsage,
};

/// Inspect and exercise LLM provider routing.
#[derive(Parser, Debug)]
#[command(name = "routewise")]
#[command(about = "Inspect provider catalogs and dry-run resilient routing")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check a provider catalog against the schema and semantic rules.
    Validate {
        /// Catalog file (YAML, or JSON by extension)
        #[arg(short, long)]
        catalog: PathBuf,
    },

    /// Show how a query is classified.
    Classify {
        /// Query text
        query: String,

        /// Runtime config supplying classifier thresholds
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the fallback chain a request would try.
    Route(RouteArgs),

    /// Run requests against simulated providers, some of them failing.
    Simulate(SimulateArgs),
}

/// Request shape shared by `route` and `simulate`.
#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Catalog file (YAML, or JSON by extension)
    #[arg(short, long)]
    pub catalog: PathBuf,

    /// Runtime configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Query text
    #[arg(short, long)]
    pub query: String,

    /// cost_optimized, balanced or quality_optimized
    #[arg(short, long, default_value = "balanced", value_parser = parse_cost_mode)]
    pub mode: CostMode,

    /// Pin a provider
    #[arg(long)]
    pub provider: Option<String>,

    /// Pin a model
    #[arg(long)]
    pub model: Option<String>,

    /// Agent persona
    #[arg(long, default_value = "")]
    pub agent: String,

    /// Completion token cap, used for cost and token limit checks
    #[arg(long)]
    pub max_tokens: Option<u32>,
}

impl RequestArgs {
    fn context(&self) -> RequestContext {
        let mut ctx = RequestContext::new(&self.query)
            .with_agent(&self.agent)
            .with_cost_mode(self.mode);
        if let Some(provider) = &self.provider {
            ctx = ctx.with_provider(provider);
        }
        if let Some(model) = &self.model {
            ctx = ctx.with_model(model);
        }
        if let Some(max_tokens) = self.max_tokens {
            ctx = ctx.with_max_tokens(max_tokens);
        }
        ctx
    }
}

#[derive(Args, Debug)]
pub struct RouteArgs {
    #[command(flatten)]
    pub request: RequestArgs,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub request: RequestArgs,

    /// Comma-separated providers that answer with HTTP 503
    #[arg(long, value_delimiter = ',')]
    pub fail: Vec<String>,

    /// Number of times to send the request
    #[arg(short = 'n', long, default_value = "1")]
    pub requests: u32,

    /// Skip retry backoff delays
    #[arg(long)]
    pub instant: bool,
}

fn parse_cost_mode(s: &str) -> Result<CostMode, String> {
    s.parse()
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Validate { catalog } => validate(&catalog),
        Commands::Classify { query, config } => classify(&query, config.as_deref()),
        Commands::Route(args) => route(args),
        Commands::Simulate(args) => simulate(args).await,
    }
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    Catalog::from_file(path).with_context(|| format!("Failed to load catalog {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load runtime config {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize JSON output")?;
    println!("{}", text);
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let catalog = load_catalog(path)?;

    println!("{}: valid (version {})", path.display(), catalog.version);
    for provider in &catalog.providers {
        let status = if provider.enabled { "" } else { " [disabled]" };
        println!(
            "  {} (priority {}, {} models){}",
            provider.name,
            provider.priority,
            provider.models.len(),
            status
        );
        if !provider.fallback_chain.is_empty() {
            println!("    fallback: {}", provider.fallback_chain.join(" -> "));
        }
    }
    println!(
        "  default: {}/{}",
        catalog.default.provider, catalog.default.model
    );
    Ok(())
}

fn classify(query: &str, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let tier = classify_with(query, &config.selector.classifier);
    print_json(&json!({
        "tier": tier,
        "estimated_tokens": estimate_tokens(query),
    }))
}

fn route(args: RouteArgs) -> Result<()> {
    let catalog = load_catalog(&args.request.catalog)?;
    let config = load_config(args.request.config.as_deref())?;
    let orchestrator = ResilienceOrchestrator::builder()
        .catalog(catalog)
        .config(config)
        .build()?;

    let plan = orchestrator.plan(&args.request.context())?;
    print_json(&serde_json::to_value(&plan)?)
}

async fn simulate(args: SimulateArgs) -> Result<()> {
    let catalog = load_catalog(&args.request.catalog)?;
    let mut config = load_config(args.request.config.as_deref())?;
    if args.instant {
        config.retry.initial_delay = Duration::ZERO;
        for policy in config.retry_overrides.values_mut() {
            policy.initial_delay = Duration::ZERO;
        }
    }

    let orchestrator = ResilienceOrchestrator::builder()
        .catalog(catalog)
        .config(config)
        .build()?;

    let failing: HashSet<String> = args.fail.iter().map(|p| p.trim().to_string()).collect();
    let failing = &failing;
    let caller = move |target: routewise_core::Target, ctx: RequestContext| async move {
        if failing.contains(&target.provider) {
            return Err(ProviderError::ApiError {
                status: 503,
                message: "simulated outage".to_string(),
            });
        }
        let prompt_tokens = u32::try_from(estimate_tokens(&ctx.query)).unwrap_or(u32::MAX);
        Ok(CompletionResponse {
            usage: TokenUsage::new(prompt_tokens, 64),
            ..CompletionResponse::text(&target.model, format!("[{}] simulated answer", target))
        })
    };

    let ctx = args.request.context();
    tracing::info!(
        requests = args.requests,
        failing = ?args.fail,
        query = %ctx.query,
        "Starting simulation"
    );
    let mut runs = Vec::new();
    for request in 1..=args.requests {
        let run = match orchestrator.handle(&ctx, &caller).await {
            Ok(routed) => json!({
                "request": request,
                "ok": true,
                "source": routed.source,
                "target": routed.target,
                "complexity": routed.complexity,
                "content": routed.response.content,
                "failures": routed.failures,
            }),
            Err(RuntimeError::AllProvidersExhausted { attempts }) => json!({
                "request": request,
                "ok": false,
                "error": "all providers exhausted",
                "failures": attempts,
            }),
            Err(RuntimeError::CostLimitExceeded(violation)) => json!({
                "request": request,
                "ok": false,
                "error": violation.to_string(),
                "violation": violation,
            }),
            Err(err) => return Err(err).context("Simulated request failed"),
        };
        runs.push(run);
    }

    print_json(&json!({
        "requests": runs,
        "breakers": orchestrator.breakers().snapshots(),
        "cache": orchestrator.cache_stats(),
        "usage": orchestrator.usage(),
    }))
}
