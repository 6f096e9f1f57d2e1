use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dds_core::{DdsOptions, Endpoint, ObserveRequest, ObserveResponse, ResourceKind, RuleObject};
use dds_kubehub::{ConfigStore, KubeConfigStore, MemoryConfigStore, PushContext};
use dds_rules::Generators;
use dds_store::{ChannelClient, Connection, Storage};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ddsctl", version, about = "DDS control-plane CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace to watch (default: all)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Policies outside this namespace are scoped to their own (env: DDS_ROOT_NAMESPACE)
    #[arg(long = "root-namespace", global = true)]
    root_namespace: Option<String>,

    /// Drop a client that leaves a push un-acked this long (env: DDS_BLOCK_MAX_TIME_MS)
    #[arg(long = "block-max-time-ms", global = true)]
    block_max_time_ms: Option<u64>,

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
    /// Print the supported resource kinds
    Kinds,
    /// Render one kind's objects for an endpoint, as a client would receive them
    Render {
        /// Kind, e.g. "AuthorizationPolicy" or "dubbo.apache.org/v1alpha1/TagRoute"
        #[arg(long = "kind", value_parser = ResourceKind::from_str)]
        kind: ResourceKind,
        /// YAML list of {name, namespace, spec}
        #[arg(long = "file")]
        file: PathBuf,
        /// Endpoint JSON (default: an endpoint with no identity)
        #[arg(long = "endpoint")]
        endpoint: Option<PathBuf>,
    },
    /// Watch the cluster and print every push a client with this identity receives
    Observe {
        /// Endpoint JSON
        #[arg(long = "endpoint")]
        endpoint: Option<PathBuf>,
        /// Kinds to subscribe to (repeatable; default: all)
        #[arg(long = "kind", value_parser = ResourceKind::from_str)]
        kinds: Vec<ResourceKind>,
    },
}

fn init_tracing() {
    let env = std::env::var("DDS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DDS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DDS_METRICS_ADDR; expected host:port");
        }
    }
}

fn options(cli: &Cli) -> DdsOptions {
    let mut o = DdsOptions::from_env();
    if let Some(ns) = &cli.root_namespace {
        o.root_namespace = ns.clone();
    }
    if let Some(ms) = cli.block_max_time_ms {
        o.block_max_time = Duration::from_millis(ms);
    }
    o
}

fn parse_objects(text: &str) -> Result<Vec<RuleObject>> {
    serde_yaml::from_str(text).context("parsing objects (expect a YAML list of {name, namespace, spec})")
}

fn load_objects(path: &Path) -> Result<Vec<RuleObject>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_objects(&text)
}

fn load_endpoint(path: Option<&Path>) -> Result<Endpoint> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing endpoint {}", p.display()))
        }
        None => Ok(Endpoint::default()),
    }
}

/// Decode payload items back into JSON for display.
fn decode_items(data: &[Vec<u8>]) -> Result<Vec<serde_json::Value>> {
    data.iter().map(|b| serde_json::from_slice(b).context("decoding payload item")).collect()
}

/// Render `objects` of `kind` for `endpoint` through the same path a live push takes.
fn render(kind: ResourceKind, objects: Vec<RuleObject>, endpoint: &Endpoint, options: DdsOptions) -> Result<Vec<serde_json::Value>> {
    let store = Arc::new(MemoryConfigStore::with_objects(kind, objects));
    let storage = Storage::new(Generators::default(), options);
    let ctx = PushContext::new(store, Arc::clone(&storage));
    let origin = ctx.notify(kind)?;
    let rule = origin.exact(storage.generators(), endpoint)?;
    decode_items(&rule.data)
}

#[derive(serde::Serialize)]
struct PushView<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    nonce: &'a str,
    revision: i64,
    data: Vec<serde_json::Value>,
}

fn print_push(output: Output, push: &ObserveResponse) -> Result<()> {
    let items = decode_items(&push.data)?;
    match output {
        Output::Human => {
            println!("{} • rev {} • nonce {} • {} item(s)", push.kind, push.revision, push.nonce, items.len());
            for item in items {
                println!("  {}", item);
            }
        }
        Output::Json => {
            let view = PushView { kind: &push.kind, nonce: &push.nonce, revision: push.revision, data: items };
            println!("{}", serde_json::to_string(&view)?);
        }
    }
    Ok(())
}

/// Print and ACK every push until the server drops the stream or Ctrl-C.
async fn relay(output: Output, client: &mut ChannelClient, conn: &Connection) -> Result<()> {
    loop {
        tokio::select! {
            push = client.next_push() => match push {
                Some(p) => {
                    print_push(output, &p)?;
                    client.request(ObserveRequest { kind: p.kind.clone(), nonce: p.nonce.clone() }).await?;
                }
                None => {
                    warn!("observe stream closed");
                    return Ok(());
                }
            },
            _ = conn.closed() => {
                warn!(conn = conn.id(), "observe stream closed by server");
                return Ok(());
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down");
                return Ok(());
            }
        }
    }
}

async fn observe(cli: &Cli, endpoint: Endpoint, mut kinds: Vec<ResourceKind>) -> Result<()> {
    if kinds.is_empty() {
        kinds = ResourceKind::ALL.to_vec();
    }
    kinds.sort();
    kinds.dedup();
    let options = options(cli);

    let store = Arc::new(KubeConfigStore::new(kinds.clone(), cli.namespace.clone()));
    let storage = Storage::new(Generators::default(), options.clone());
    let ctx = Arc::new(PushContext::new(Arc::clone(&store) as Arc<dyn ConfigStore>, Arc::clone(&storage)));
    ctx.register(&kinds);

    let (stop_tx, stop_rx) = watch::channel(false);
    let store_task = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.start(stop_rx).await }
    });

    let (server, mut client) = dds_store::channel(options.request_buffer);
    let conn = storage.connected(endpoint, Arc::new(server));
    info!(conn = conn.id(), endpoint = %conn.endpoint(), kinds = kinds.len(), "observing");
    for &kind in &kinds {
        client.subscribe(kind).await?;
    }

    relay(cli.output, &mut client, &conn).await?;

    storage.disconnect(&conn);
    let _ = stop_tx.send(true);
    match store_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = ?e, "config store failed"),
        Err(e) => error!(error = %e, "config store task panicked"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Kinds => match cli.output {
            Output::Human => {
                for k in ResourceKind::ALL {
                    println!("{} • {}", k.as_str(), k.plural());
                }
            }
            Output::Json => {
                let keys: Vec<_> = ResourceKind::ALL.iter().map(|k| k.as_str()).collect();
                println!("{}", serde_json::to_string_pretty(&keys)?);
            }
        },
        Commands::Render { kind, file, endpoint } => {
            let objects = load_objects(file)?;
            let endpoint = load_endpoint(endpoint.as_deref())?;
            info!(kind = kind.kind(), objects = objects.len(), endpoint = %endpoint, "render invoked");
            let items = render(*kind, objects, &endpoint, options(&cli))?;
            match cli.output {
                Output::Human => {
                    for item in &items {
                        let key = item.get("key").and_then(|k| k.as_str()).unwrap_or("");
                        println!("{}\t{}", key, item.get("spec").cloned().unwrap_or_default());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Observe { endpoint, kinds } => {
            let endpoint = load_endpoint(endpoint.as_deref())?;
            observe(&cli, endpoint, kinds.clone()).await?;
        }
    }

    Ok(())
}
