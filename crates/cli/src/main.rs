use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use stagehand_apply::{plan, Plan};
use stagehand_core::{EngineConfig, GroupKind, ManagedResource, RuleSource, Stage, TypeRef};
use stagehand_engine::{Engine, EngineDeps};
use stagehand_expr::{format_duration, PathEvaluator};
use stagehand_resolver::{Candidate, FileRuleSource, StageIndex};
use stagehand_schedule::compute_delay;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "stagehandctl", version, about = "Stagehand stage engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive objects in the current kube context through their stages
    Run {
        /// Rule files or directories
        #[arg(long = "rules", env = "STAGEHAND_RULES", value_delimiter = ',', required = true)]
        rules: Vec<PathBuf>,
        /// Types to manage, e.g. "v1/Pod" or "apps/v1/Deployment"
        #[arg(long = "kind", default_values_t = ["v1/Node".to_string(), "v1/Pod".to_string()])]
        kinds: Vec<String>,
        /// Only touch objects matching this label selector
        #[arg(long = "manage-selector", env = "STAGEHAND_MANAGE_SELECTOR")]
        manage_selector: Option<String>,
        #[arg(long = "pod-parallelism", env = "STAGEHAND_POD_PARALLELISM")]
        pod_parallelism: Option<usize>,
        #[arg(long = "node-parallelism", env = "STAGEHAND_NODE_PARALLELISM")]
        node_parallelism: Option<usize>,
        #[arg(long = "lease-duration-secs", env = "STAGEHAND_LEASE_DURATION_SECS")]
        lease_duration_secs: Option<u32>,
        #[arg(long = "lease-namespace", env = "STAGEHAND_LEASE_NAMESPACE")]
        lease_namespace: Option<String>,
    },
    /// Validate rule files and summarize them
    Check {
        #[arg(long = "rules", env = "STAGEHAND_RULES", value_delimiter = ',', required = true)]
        rules: Vec<PathBuf>,
    },
    /// Offline: show which stage an object would take and what it would write
    Resolve {
        #[arg(long = "rules", env = "STAGEHAND_RULES", value_delimiter = ',', required = true)]
        rules: Vec<PathBuf>,
        /// Object manifest (YAML or JSON)
        #[arg(long = "object")]
        object: PathBuf,
        /// Seed for the weighted pick and jitter
        #[arg(long = "seed")]
        seed: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("STAGEHAND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STAGEHAND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => {
                    info!(addr = %addr, "Prometheus metrics exporter listening");
                    metrics::gauge!("stagehand_build_info", 1.0, "version" => env!("CARGO_PKG_VERSION"));
                }
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STAGEHAND_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { rules, kinds, manage_selector, pod_parallelism, node_parallelism, lease_duration_secs, lease_namespace } => {
            init_metrics();
            let mut cfg = EngineConfig::from_env();
            if manage_selector.is_some() { cfg.manage_selector = manage_selector; }
            if let Some(n) = pod_parallelism { cfg.pod_parallelism = n.max(1); }
            if let Some(n) = node_parallelism { cfg.node_parallelism = n.max(1); }
            if let Some(n) = lease_duration_secs { cfg.lease_duration_secs = n; }
            if let Some(ns) = lease_namespace { cfg.lease_namespace = ns; }
            let types = parse_kinds(&kinds)?;
            run(cfg, rules, types).await?;
        }
        Commands::Check { rules } => {
            let stages = load_rules(&rules).await?;
            let index = StageIndex::build(stages.clone()).context("building rule index")?;
            let rows: Vec<StageRow> = stages.iter().map(StageRow::from).collect();
            match cli.output {
                Output::Human => {
                    println!("{:<28} {:<16} {:>6}  {:<14} ACTIONS", "STAGE", "KIND", "WEIGHT", "DELAY");
                    for r in &rows {
                        println!("{:<28} {:<16} {:>6}  {:<14} {}", r.name, r.kind, r.weight, r.delay, r.actions.join(","));
                    }
                    println!("{} stage(s) across {} kind(s)", index.len(), index.kinds().len());
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Resolve { rules, object, seed } => {
            let stages = load_rules(&rules).await?;
            let index = StageIndex::build(stages).context("building rule index")?;
            let res = read_object(&object)?;
            let mut rng = match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            };
            let report = resolve_report(&index, &res, &mut rng)?;
            match cli.output {
                Output::Human => print_report(&report),
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
    }
    Ok(())
}

fn parse_kinds(kinds: &[String]) -> Result<Vec<TypeRef>> {
    let mut out: Vec<TypeRef> = Vec::with_capacity(kinds.len());
    for k in kinds {
        let t = TypeRef::parse(k).map_err(|e| anyhow!("--kind {k}: {e}"))?;
        if !out.contains(&t) {
            out.push(t);
        }
    }
    Ok(out)
}

async fn load_rules(paths: &[PathBuf]) -> Result<Vec<Stage>> {
    let source = FileRuleSource::new(paths.iter().cloned());
    let stages = source.load().await.with_context(|| format!("loading rules from {}", source.describe()))?;
    info!(count = stages.len(), source = %source.describe(), "rules loaded");
    Ok(stages)
}

fn read_object(path: &Path) -> Result<ManagedResource> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: serde_json::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    ManagedResource::from_raw(raw).map_err(|e| anyhow!("{}: {e}", path.display()))
}

async fn run(cfg: EngineConfig, rules: Vec<PathBuf>, types: Vec<TypeRef>) -> Result<()> {
    let t0 = Instant::now();
    let kube = stagehand_kubehub::KubeClient::try_default().await?;
    let client = kube.client();
    let deps = EngineDeps::new(
        Arc::new(kube),
        Arc::new(stagehand_kubehub::KubeEventSink::new(client.clone(), "stagehand")),
        Arc::new(stagehand_kubehub::KubeLeaseClient::new(client.clone(), &cfg.lease_namespace)),
    );
    let source = Arc::new(FileRuleSource::new(rules));
    let kinds: Vec<GroupKind> = types.iter().map(|t| t.group_kind()).collect();
    let engine = Arc::new(Engine::start(&cfg, source, deps, kinds).await?);

    // Nodes are always watched so their leases get renewed.
    let mut watched = types;
    if !watched.iter().any(|t| t.group.is_empty() && t.kind == "Node") {
        watched.push(TypeRef::new("", "v1", "Node"));
    }
    let (tx, rx) = mpsc::channel(cfg.queue_cap.clamp(16, 8192));
    let mut watchers = Vec::with_capacity(watched.len());
    for t in watched {
        let client = client.clone();
        let tx = tx.clone();
        let selector = cfg.manage_selector.clone();
        watchers.push(tokio::spawn(async move {
            if let Err(e) = stagehand_kubehub::start_watcher(client, &t, selector.as_deref(), tx).await {
                error!(type_ref = %t, error = ?e, "watcher failed");
            }
        }));
    }
    drop(tx);
    let feed = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run_feed(rx).await }
    });
    info!(kinds = ?engine.kinds(), took_ms = %t0.elapsed().as_millis(), "stagehand running");

    wait_for_shutdown(&engine).await;

    engine.shutdown_token().cancel();
    for w in &watchers {
        w.abort();
    }
    if let Err(e) = feed.await {
        warn!(error = %e, "feed task failed");
    }
    match Arc::try_unwrap(engine) {
        Ok(engine) => {
            for (kind, s) in engine.shutdown().await {
                info!(kind = %kind, cycles = s.cycles, applied = s.applied, conflicts = s.conflicts, dropped = s.dropped, "final stats");
            }
        }
        Err(_) => warn!("engine still referenced at shutdown"),
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(engine: &Engine) {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};
    let mut hup = match unix_signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable; reload disabled");
            None
        }
    };
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down");
                return;
            }
            Some(_) = async { match hup.as_mut() { Some(h) => h.recv().await, None => std::future::pending().await } } => {
                info!("SIGHUP received; reloading rules");
                if let Err(e) = engine.reload().await {
                    error!(error = %e, "reload failed");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_engine: &Engine) {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed");
    }
}

#[derive(Debug, Serialize)]
struct StageRow {
    name: String,
    kind: String,
    weight: u32,
    delay: String,
    actions: Vec<&'static str>,
}

impl From<&Stage> for StageRow {
    fn from(s: &Stage) -> Self {
        let delay = match &s.delay {
            None => "-".to_string(),
            Some(d) => {
                let base = match (&d.duration_from, d.duration_milliseconds) {
                    (Some(f), _) => f.expression_from.clone(),
                    (None, Some(ms)) => format_duration(Duration::from_millis(ms.max(0) as u64)),
                    (None, None) => "0s".to_string(),
                };
                if d.jitter_duration_milliseconds.is_some() || d.jitter_duration_from.is_some() { format!("{base}~") } else { base }
            }
        };
        let n = &s.next;
        let mut actions = Vec::new();
        if n.status_template.is_some() { actions.push("status"); }
        if !n.patches.is_empty() { actions.push("patch"); }
        if n.finalizers.is_some() { actions.push("finalizers"); }
        if n.event.is_some() { actions.push("event"); }
        if n.delete { actions.push("delete"); }
        if n.immediate_next_stage { actions.push("immediate"); }
        if actions.is_empty() { actions.push("none"); }
        Self { name: s.name.clone(), kind: s.group_kind().to_string(), weight: s.weight, delay, actions }
    }
}

#[derive(Debug, Serialize)]
struct ResolveReport {
    object: String,
    candidates: Vec<Candidate>,
    chosen: Option<String>,
    delay_ms: Option<u64>,
    plan: Option<Plan>,
}

fn resolve_report(index: &StageIndex, res: &ManagedResource, rng: &mut StdRng) -> Result<ResolveReport> {
    let ev = PathEvaluator::new();
    let now = chrono::Utc::now();
    let candidates = index.explain(res, &ev);
    let Some(stage) = index.resolve_with(res, &ev, rng) else {
        return Ok(ResolveReport { object: res.key.to_string(), candidates, chosen: None, delay_ms: None, plan: None });
    };
    let delay = compute_delay(res, &stage, now, &ev, rng);
    let planned = plan(res, &stage, &ev, now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()))
        .map_err(|e| anyhow!("{e}"))?;
    Ok(ResolveReport {
        object: res.key.to_string(),
        candidates,
        chosen: Some(stage.name.clone()),
        delay_ms: Some(delay.as_millis() as u64),
        plan: Some(planned),
    })
}

fn print_report(r: &ResolveReport) {
    println!("object: {}", r.object);
    println!("{:<28} {:<8} WEIGHT", "CANDIDATE", "MATCH");
    for c in &r.candidates {
        println!("{:<28} {:<8} {}", c.stage, if c.matched { "yes" } else { "no" }, c.weight);
    }
    let Some(chosen) = &r.chosen else {
        println!("no stage matches");
        return;
    };
    println!("chosen: {chosen}");
    if let Some(ms) = r.delay_ms {
        println!("delay: {}", format_duration(Duration::from_millis(ms)));
    }
    let Some(p) = &r.plan else { return };
    for (i, req) in p.patches.iter().enumerate() {
        let target = req.subresource.as_deref().unwrap_or("object");
        let as_user = req.identity.as_deref().map(|u| format!(" as {u}")).unwrap_or_default();
        println!("  {}. {} patch on {}{}: {}", i + 1, req.body.kind(), target, as_user, req.body.value());
    }
    if let Some(f) = &p.finalizers {
        println!("  finalizers: {}", f.body.value());
    }
    if let Some(e) = &p.event {
        println!("  event: {} {}: {}", e.event_type, e.reason, e.message);
    }
    if p.delete {
        println!("  delete");
    }
    if p.skipped_noop > 0 {
        println!("  ({} patch(es) skipped: no change)", p.skipped_noop);
    }
}
