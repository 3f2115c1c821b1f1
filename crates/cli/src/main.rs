use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kindex_api::{CacheMode, Kindex, KindexApi};
use kindex_core::{KindexConfig, OpContext};
use kindex_store::StoreStatus;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kindexctl", version, about = "Kindex CLI: discovery-driven access to any Kubernetes kind")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace; empty means all namespaces for list-style commands
    #[arg(short = 'n', long = "ns", global = true)]
    namespace: Option<String>,

    /// Explicit kubeconfig path
    #[arg(long, global = true, env = "KINDEX_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Local mirror population: off, lazy or eager
    #[arg(long = "cache-mode", global = true, env = "KINDEX_CACHE_MODE", default_value = "off")]
    cache_mode: String,

    /// Per-command deadline in seconds (0 disables)
    #[arg(long = "timeout", global = true, default_value_t = 60)]
    timeout_secs: u64,

    /// Log filter directives (tracing EnvFilter syntax)
    #[arg(long = "log", global = true, env = "KINDEX_LOG")]
    log: Option<String>,

    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", global = true, env = "KINDEX_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List served resource types
    ApiResources {
        /// Leave out namespace-scoped kinds
        #[arg(long = "no-namespaced", action = ArgAction::SetTrue)]
        no_namespaced: bool,
        /// Leave out cluster-scoped kinds
        #[arg(long = "no-cluster", action = ArgAction::SetTrue)]
        no_cluster: bool,
    },
    /// Fetch one object
    Get { kind: String, name: String },
    /// Fetch one object in full (YAML in human output)
    Describe { kind: String, name: String },
    /// List objects of a kind
    List {
        kind: String,
        #[arg(short = 'l', long = "selector")]
        label_selector: Option<String>,
        #[arg(long = "field-selector")]
        field_selector: Option<String>,
    },
    /// Create or merge-patch from a JSON/YAML manifest ("-" reads stdin)
    Apply {
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
        /// Kind override when the manifest has none
        #[arg(long)]
        kind: Option<String>,
    },
    Delete { kind: String, name: String },
    /// Restart the pods of a template-bearing workload
    RolloutRestart { kind: String, name: String },
    /// Tail pod logs; all containers when none is named
    Logs {
        pod: String,
        #[arg(short = 'c', long = "container")]
        container: Option<String>,
        #[arg(long = "tail", default_value_t = 100)]
        tail: i64,
    },
    /// Ingress rules flattened to host/path -> service:port
    Ingresses {
        #[arg(long)]
        host: Option<String>,
    },
    TopPod { pod: String },
    TopNode { node: String },
    Events {
        #[arg(short = 'l', long = "selector")]
        label_selector: Option<String>,
    },
    /// Mirror status per kind
    SyncStatus {
        /// Wait for the initial lists before reporting
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
    },
}

/// Targets that log at info by default; dependencies stay at warn.
const DEFAULT_LOG_FILTER: &str = "warn,kindexctl=info,kindex_api=info,kindex_store=info,kindex_kubehub=info,kindex_apply=info,kindex_ops=info";

fn init_tracing(filter: Option<&str>) {
    let filter = filter.filter(|f| !f.trim().is_empty()).unwrap_or(DEFAULT_LOG_FILTER);
    let env = tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|e| {
        eprintln!("ignoring invalid log filter {:?}: {}", filter, e);
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    });
    // stdout carries command output only
    tracing_subscriber::fmt().with_env_filter(env).with_target(true).with_writer(std::io::stderr).init();
}

fn describe_metrics() {
    describe_counter!("kindex_discovery_calls_total", "Discovery round trips to the API server");
    describe_counter!("kindex_watch_failures_total", "Watch stream failures, before and after the initial list");
    describe_counter!("kindex_store_hits_total", "Reads answered from a synced mirror");
    describe_counter!("kindex_store_misses_total", "Reads with no synced mirror for the kind");
    describe_counter!("kindex_live_reads_total", "Reads sent to the API server");
    describe_counter!("kindex_upserts_total", "Upserts by outcome label");
    describe_histogram!("kindex_upsert_latency_ms", "Upsert latency in milliseconds");
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            describe_metrics();
            info!(%addr, "metrics: prometheus exporter listening");
        }
        Err(e) => warn!(%addr, error = %e, "metrics: exporter not installed"),
    }
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn read_manifest(path: &PathBuf) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut s = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut s).context("reading manifest from stdin")?;
        return Ok(s);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

fn status_label(s: &StoreStatus) -> String {
    match s {
        StoreStatus::Pending => "pending".into(),
        StoreStatus::Synced => "synced".into(),
        StoreStatus::Failed(reason) => format!("failed ({})", reason),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());
    init_metrics(cli.metrics_addr);

    let mut config = KindexConfig::from_env();
    config.kubeconfig = cli.kubeconfig.clone();
    config.cache_mode = CacheMode::from_str(&cli.cache_mode).map_err(anyhow::Error::msg)?;
    let api = Kindex::connect(config).await?;

    let mut ctx = OpContext::new();
    if cli.timeout_secs > 0 {
        ctx = ctx.with_timeout(Duration::from_secs(cli.timeout_secs));
    }
    let token = ctx.token().clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });

    let res = run(&cli, &api, &ctx).await;
    api.shutdown().await;
    res
}

async fn run(cli: &Cli, api: &Kindex, ctx: &OpContext) -> Result<()> {
    let ns = cli.namespace.as_deref().filter(|n| !n.is_empty());
    let human = cli.output == Output::Human;
    match &cli.command {
        Commands::ApiResources { no_namespaced, no_cluster } => {
            let rows = api.api_resources(ctx, !no_namespaced, !no_cluster).await?;
            if !human {
                return print_json(&rows);
            }
            println!("{:<36} {:<28} {:<28} {:<10}", "NAME", "APIVERSION", "KIND", "NAMESPACED");
            for r in rows {
                let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                println!("{:<36} {:<28} {:<28} {:<10}", r.name, gv, r.kind, r.namespaced);
            }
        }
        Commands::Get { kind, name } => {
            let obj = api.get(ctx, kind, name, ns).await?;
            if human {
                let s = kindex_core::ObjectSummary::project(kind, &obj);
                println!("{} {} {}", s.kind, dash(&s.namespace), s.name);
            } else {
                print_json(&obj)?;
            }
        }
        Commands::Describe { kind, name } => {
            let obj = api.describe(ctx, kind, name, ns).await?;
            if human {
                print!("{}", serde_yaml::to_string(&obj)?);
            } else {
                print_json(&obj)?;
            }
        }
        Commands::List { kind, label_selector, field_selector } => {
            let res = api.list(ctx, kind, ns, label_selector.as_deref(), field_selector.as_deref()).await?;
            if !human {
                return print_json(&res);
            }
            let mut items = res.items;
            items.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
            println!("{:<20} {:<40}", "NAMESPACE", "NAME");
            for it in &items {
                println!("{:<20} {:<40}", dash(&it.namespace), it.name);
            }
            info!(items = items.len(), cached = res.served_from_cache, "list done");
        }
        Commands::Apply { file, kind } => {
            let text = read_manifest(file)?;
            let out = api.upsert_text(ctx, kind.as_deref(), ns, &text).await?;
            if human {
                let s = kindex_core::ObjectSummary::project(kind.as_deref().unwrap_or(""), &out.object);
                println!("{} {:?}", s.name, out.action);
            } else {
                print_json(&out)?;
            }
        }
        Commands::Delete { kind, name } => {
            api.delete(ctx, kind, name, ns).await?;
            if human {
                println!("{} {} deleted", kind, name);
            } else {
                print_json(&serde_json::json!({"deleted": {"kind": kind, "name": name, "namespace": ns}}))?;
            }
        }
        Commands::RolloutRestart { kind, name } => {
            let obj = api.rollout_restart(ctx, kind, name, ns).await?;
            if human {
                println!("{} {} restarted", kind, name);
            } else {
                print_json(&obj)?;
            }
        }
        Commands::Logs { pod, container, tail } => {
            let text = api.pod_logs(ctx, ns, pod, container.as_deref(), *tail).await?;
            if human {
                print!("{}", text);
            } else {
                print_json(&serde_json::json!({"pod": pod, "logs": text}))?;
            }
        }
        Commands::Ingresses { host } => {
            let rows = api.ingresses(ctx, host.as_deref()).await?;
            if !human {
                return print_json(&rows);
            }
            for ing in rows {
                println!("{}/{}", ing.namespace, ing.name);
                for p in ing.paths {
                    let port = if p.port_name.is_empty() { p.port_num.to_string() } else { p.port_name.clone() };
                    println!("  {}{} -> {}:{}", p.host, p.path, p.service_name, port);
                }
            }
        }
        Commands::TopPod { pod } => {
            let u = api.pod_usage(ctx, ns, pod).await?;
            if !human {
                return print_json(&u);
            }
            println!("{:<30} {:<10} {:<10}", "CONTAINER", "CPU", "MEMORY");
            for c in &u.containers {
                println!("{:<30} {:<10} {:<10}", c.name, c.cpu, c.memory);
            }
        }
        Commands::TopNode { node } => {
            let u = api.node_usage(ctx, node).await?;
            if human {
                println!("{:<30} {:<10} {:<10}", "NODE", "CPU", "MEMORY");
                println!("{:<30} {:<10} {:<10}", u.node_name, u.usage.cpu, u.usage.memory);
            } else {
                print_json(&u)?;
            }
        }
        Commands::Events { label_selector } => {
            let rows = api.events(ctx, ns, label_selector.as_deref()).await?;
            if !human {
                return print_json(&rows);
            }
            println!("{:<22} {:<8} {:<20} {:<6} {}", "LAST SEEN", "TYPE", "REASON", "COUNT", "MESSAGE");
            for e in rows {
                println!("{:<22} {:<8} {:<20} {:<6} {}", e.last_time.as_deref().unwrap_or("-"), e.type_, e.reason, e.count, e.message);
            }
        }
        Commands::SyncStatus { wait } => {
            if *wait && !api.wait_synced(None).await {
                warn!("mirrors not synced before timeout");
            }
            let report = api.sync_status().await;
            if !human {
                return print_json(&report);
            }
            println!("mode: {:?}  all synced: {}", report.mode, report.all_synced);
            for k in report.kinds {
                println!("{:<32} {:<40} {:<8} {}", k.kind, k.coordinate, k.objects, status_label(&k.status));
            }
        }
    }
    Ok(())
}
