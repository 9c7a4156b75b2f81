//! `judgectl`: operator tooling for the SLO judge.
//!
//! ## Commands
//!
//! - `judge`: run a k-of-n quorum over local and remote judges, optionally
//!   attaching the outcome to the evidence as a resealed `judges` block
//! - `sign`: produce the signed request headers for a `/judge` body
//!
//! Exit status is `0` when the quorum passes and `2` on a failing quorum or
//! any error, so the command can gate a deploy step directly.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use judge_core::auth::{HEADER_KEY_ID, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use judge_core::keys::RefreshOutcome;
use judge_core::quorum::{
    decide, HttpJudge, HttpJudgeConfig, JudgeProvider, LocalJudge, QuorumOptions, QuorumResult,
};
use judge_core::telemetry::init_tracing;
use judge_core::{canonical_json, Clock, Evidence, JudgeConfig, KeyStore, SloSpec, SystemClock};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, Level};

#[derive(Parser)]
#[command(name = "judgectl")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "SLO judge operator CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge evidence against an SLO with a k-of-n quorum
    Judge {
        /// SLO document (JSON)
        #[arg(long)]
        slo: PathBuf,

        /// Evidence document (JSON)
        #[arg(long)]
        evidence: PathBuf,

        /// Quorum as k/n (default: the SLO's quorum block, or k/len with --providers)
        #[arg(long, value_parser = parse_quorum)]
        quorum: Option<(usize, usize)>,

        /// Remote judge endpoint; remaining seats are local judges
        #[arg(long = "remote", conflicts_with = "providers")]
        remotes: Vec<String>,

        /// Provider list (YAML or JSON) naming every seat
        #[arg(long)]
        providers: Option<PathBuf>,

        /// Per-provider deadline in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,

        /// Write the evidence with a resealed `judges` block to this path
        #[arg(long, value_name = "PATH")]
        attach_evidence: Option<PathBuf>,
    },

    /// Print signed request headers and the canonical body
    Sign {
        /// Request body (JSON)
        #[arg(long)]
        body: PathBuf,

        /// Key to sign with
        #[arg(long)]
        key_id: String,
    },
}

/// Parse `k/n`.
fn parse_quorum(raw: &str) -> Result<(usize, usize), String> {
    let (k, n) = raw
        .split_once('/')
        .ok_or_else(|| format!("expected k/n, got {raw:?}"))?;
    let k: usize = k.trim().parse().map_err(|_| format!("bad k in {raw:?}"))?;
    let n: usize = n.trim().parse().map_err(|_| format!("bad n in {raw:?}"))?;
    if k == 0 || k > n {
        return Err(format!("need 0 < k <= n, got {k}/{n}"));
    }
    Ok((k, n))
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Keys from the configured `JUDGE_KEYS*` sources.
async fn load_keys() -> Result<Arc<KeyStore>> {
    let cfg = JudgeConfig::from_env().context("Failed to read JUDGE_* configuration")?;
    let keys = Arc::new(KeyStore::new(
        cfg.key_sources(),
        cfg.keys.clone(),
        Arc::new(SystemClock),
    ));
    if let RefreshOutcome::Degraded { reason } = keys.refresh().await {
        bail!("no signing keys available: {reason}");
    }
    Ok(keys)
}

/// `providers:` document for `--providers`.
#[derive(Debug, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: Vec<ProviderDef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ProviderDef {
    Local {
        id: String,
    },
    Http {
        id: String,
        url: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_retries")]
        retries: u32,
        key_id: Option<String>,
        #[serde(default = "default_breaker_max_failures")]
        breaker_max_failures: u32,
        #[serde(default = "default_breaker_reset_seconds")]
        breaker_reset_seconds: f64,
        #[serde(default)]
        insecure: bool,
    },
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_retries() -> u32 {
    2
}

fn default_breaker_max_failures() -> u32 {
    3
}

fn default_breaker_reset_seconds() -> f64 {
    5.0
}

impl ProviderDef {
    fn is_remote(&self) -> bool {
        matches!(self, Self::Http { .. })
    }
}

fn load_provider_defs(path: &Path) -> Result<Vec<ProviderDef>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: ProvidersFile = serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse providers {}", path.display()))?;
    if file.providers.is_empty() {
        bail!("no providers configured in {}", path.display());
    }
    Ok(file.providers)
}

/// One provider per definition, in file order.
fn providers_from_defs(
    defs: &[ProviderDef],
    keys: Option<Arc<KeyStore>>,
) -> Result<Vec<Arc<dyn JudgeProvider>>> {
    let mut providers: Vec<Arc<dyn JudgeProvider>> = Vec::with_capacity(defs.len());
    for def in defs {
        match def {
            ProviderDef::Local { id } => providers.push(Arc::new(LocalJudge::new(id.clone()))),
            ProviderDef::Http {
                id,
                url,
                timeout_ms,
                retries,
                key_id,
                breaker_max_failures,
                breaker_reset_seconds,
                insecure,
            } => {
                if *insecure {
                    bail!("provider {id}: insecure TLS is not supported");
                }
                if !breaker_reset_seconds.is_finite() || *breaker_reset_seconds < 0.0 {
                    bail!("provider {id}: breaker_reset_seconds must be a non-negative number");
                }
                let keys = keys
                    .clone()
                    .ok_or_else(|| anyhow!("remote judges need signing keys"))?;
                let mut config = HttpJudgeConfig::new(id.clone(), url.clone());
                config.request_timeout = Duration::from_millis(*timeout_ms);
                config.max_attempts = retries + 1;
                config.key_id = key_id.clone();
                config.breaker_max_failures = *breaker_max_failures;
                config.breaker_reset = Duration::from_secs_f64(*breaker_reset_seconds);
                providers.push(Arc::new(HttpJudge::new(config, keys, Arc::new(SystemClock))));
            }
        }
    }
    Ok(providers)
}

/// `remotes` first, then local judges up to `n` seats.
fn build_providers(
    remotes: &[String],
    n: usize,
    keys: Option<Arc<KeyStore>>,
) -> Result<Vec<Arc<dyn JudgeProvider>>> {
    if remotes.len() > n {
        bail!("{} remote judges for a quorum of {n}", remotes.len());
    }
    let mut providers: Vec<Arc<dyn JudgeProvider>> = Vec::with_capacity(n);
    if !remotes.is_empty() {
        let keys = keys.ok_or_else(|| anyhow!("remote judges need signing keys"))?;
        for (i, url) in remotes.iter().enumerate() {
            let config = HttpJudgeConfig::new(format!("remote-{}", i + 1), url.clone());
            providers.push(Arc::new(HttpJudge::new(
                config,
                Arc::clone(&keys),
                Arc::new(SystemClock),
            )));
        }
    }
    for i in remotes.len()..n {
        providers.push(Arc::new(LocalJudge::new(format!("local-{}", i + 1))));
    }
    Ok(providers)
}

/// Inputs of `judgectl judge`.
struct JudgeArgs<'a> {
    slo: &'a Path,
    evidence: &'a Path,
    quorum: Option<(usize, usize)>,
    remotes: &'a [String],
    providers: Option<&'a Path>,
    timeout: Duration,
    attach_evidence: Option<&'a Path>,
}

async fn cmd_judge(args: &JudgeArgs<'_>) -> Result<QuorumResult> {
    let slo = SloSpec::from_value(read_json(args.slo)?)
        .with_context(|| format!("Invalid SLO {}", args.slo.display()))?;
    let mut evidence = Evidence::from_value(read_json(args.evidence)?)
        .with_context(|| format!("Invalid evidence {}", args.evidence.display()))?;

    let defs = args.providers.map(load_provider_defs).transpose()?;
    let (k, n) = match (args.quorum, &defs) {
        (Some(q), _) => q,
        (None, Some(defs)) => (slo.quorum.k as usize, defs.len()),
        (None, None) => (slo.quorum.k as usize, slo.quorum.n as usize),
    };
    let needs_keys = match &defs {
        Some(defs) => defs.iter().any(ProviderDef::is_remote),
        None => !args.remotes.is_empty(),
    };
    let keys = if needs_keys {
        Some(load_keys().await?)
    } else {
        None
    };
    let providers = match &defs {
        Some(defs) => providers_from_defs(defs, keys)?,
        None => build_providers(args.remotes, n, keys)?,
    };
    let options = QuorumOptions::from_slo(&slo).with_timeout(args.timeout);
    debug!(k, n, providers = providers.len(), "running quorum");

    let result = decide(&providers, &evidence, &slo, k, n, &options)
        .await
        .context("Quorum failed")?;
    info!(
        pass_count = result.pass_count,
        degraded = result.degraded,
        "quorum decided"
    );

    if let Some(path) = args.attach_evidence {
        attach_judges(&mut evidence, &result, path)?;
        info!(path = %path.display(), "judges block attached");
    }
    Ok(result)
}

/// Merge the quorum outcome into `evidence` as its `judges` block, reseal,
/// and write the document as indented JSON with sorted keys.
fn attach_judges(evidence: &mut Evidence, result: &QuorumResult, path: &Path) -> Result<()> {
    evidence.set_block(
        "judges",
        json!({
            "k": result.k,
            "n": result.n,
            "final": result.final_decision,
            "votes": result.votes,
        }),
    );
    evidence.seal();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let rendered = serde_json::to_string_pretty(evidence.as_map())?;
    std::fs::write(path, rendered + "\n")
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Header lines and canonical body for `body` signed with `key_id`.
///
/// The nonce and timestamp are written into the body as well as the headers,
/// so the signature covers them.
fn signed_request(keys: &KeyStore, body: &Value, key_id: &str, clock: &dyn Clock) -> Result<String> {
    let Value::Object(fields) = body else {
        bail!("request body must be a JSON object");
    };
    let nonce = uuid::Uuid::new_v4().to_string();
    let ts = clock.now().timestamp();

    let mut bound = fields.clone();
    bound.insert("nonce".to_string(), json!(nonce));
    bound.insert("ts".to_string(), json!(ts));
    let bound = Value::Object(bound);

    let signature = keys
        .sign(&bound, key_id)
        .with_context(|| format!("Failed to sign with key {key_id}"))?;
    Ok(format!(
        "{HEADER_KEY_ID}: {key_id}\n{HEADER_SIGNATURE}: {signature}\n{HEADER_NONCE}: {nonce}\n{HEADER_TIMESTAMP}: {ts}\n\n{}",
        canonical_json(&bound)
    ))
}

async fn cmd_sign(body_path: &Path, key_id: &str) -> Result<String> {
    let body = read_json(body_path)?;
    let keys = load_keys().await?;
    signed_request(&keys, &body, key_id, &SystemClock)
}

async fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Judge {
            slo,
            evidence,
            quorum,
            remotes,
            providers,
            timeout_ms,
            attach_evidence,
        } => {
            let result = cmd_judge(&JudgeArgs {
                slo: &slo,
                evidence: &evidence,
                quorum,
                remotes: &remotes,
                providers: providers.as_deref(),
                timeout: Duration::from_millis(timeout_ms),
                attach_evidence: attach_evidence.as_deref(),
            })
            .await?;
            // serde_json maps are ordered, so the pretty output has sorted keys
            let rendered = serde_json::to_value(&result)?;
            println!("{}", serde_json::to_string_pretty(&rendered)?);
            Ok(result.passed())
        }
        Commands::Sign { body, key_id } => {
            println!("{}", cmd_sign(&body, &key_id).await?);
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    init_tracing(cli.json, level);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
