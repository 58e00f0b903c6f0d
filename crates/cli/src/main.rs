use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use fleetsync_api::Reconciler;
use fleetsync_apply::{parse_manifest, ApplySettings};
use fleetsync_core::{
    describe, generation, DiscoveryConfig, LabelSelector, ManagedResource, RequestContext, TransportConfig,
};
use fleetsync_kubehub::{parse_gvk_key, KubeResourceClient};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fleetctl", version, about = "Generation-gated apply for fleet clusters")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace (default: the manifest's own, else the current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Transport { Kubernetes, Maestro }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a rendered manifest if its generation changed
    Apply {
        /// YAML or JSON file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long = "transport", value_enum, default_value_t = Transport::Kubernetes, env = "FLEETSYNC_TRANSPORT")]
        transport: Transport,
        /// Consumer for the maestro transport
        #[arg(long = "target-cluster", env = "FLEETSYNC_TARGET_CLUSTER")]
        target_cluster: Option<String>,
        /// Execute generation changes as delete + create
        #[arg(long = "recreate-on-change", action = ArgAction::SetTrue)]
        recreate_on_change: bool,
    },
    /// Fetch one object
    Get {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        name: String,
        /// Look inside this consumer's envelopes instead of the cluster
        #[arg(long = "target-cluster")]
        target_cluster: Option<String>,
    },
    /// Find objects by name or label selector
    Discover {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        #[arg(long = "name", conflicts_with = "selector")]
        name: Option<String>,
        /// Comma separated k=v pairs
        #[arg(long = "selector")]
        selector: Option<String>,
        #[arg(long = "target-cluster")]
        target_cluster: Option<String>,
    },
}

/// JSON output keeps stdout machine-readable: quieter default level, no ANSI,
/// no targets. Logs always go to stderr; `FLEETSYNC_LOG` overrides the level.
fn default_log_directive(output: Output) -> &'static str {
    match output {
        Output::Human => "info",
        Output::Json => "warn",
    }
}

fn init_tracing(output: Output) {
    let default = default_log_directive(output);
    let filter = std::env::var("FLEETSYNC_LOG")
        .ok()
        .and_then(|env| tracing_subscriber::EnvFilter::from_str(&env).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new(default));
    let human = output == Output::Human;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(human)
        .with_ansi(human)
        .with_writer(std::io::stderr)
        .init();
}

fn metrics_listener(addr: &str) -> Option<std::net::SocketAddr> {
    addr.parse::<std::net::SocketAddr>().ok()
}

/// Prometheus exporter for the `fleetsync_apply_*` series, when
/// `FLEETSYNC_METRICS_ADDR` is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("FLEETSYNC_METRICS_ADDR") else {
        return;
    };
    match metrics_listener(&addr) {
        Some(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %sock, "metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        None => warn!(addr = %addr, "invalid FLEETSYNC_METRICS_ADDR; expected host:port"),
    }
}

fn transport_config(transport: Transport, target_cluster: Option<String>) -> Result<TransportConfig> {
    match (transport, target_cluster) {
        (Transport::Kubernetes, _) => Ok(TransportConfig::Kubernetes),
        (Transport::Maestro, Some(c)) if !c.is_empty() => Ok(TransportConfig::Maestro { target_cluster: c }),
        (Transport::Maestro, _) => bail!("--transport maestro needs --target-cluster"),
    }
}

fn routing_for(target_cluster: Option<String>) -> TransportConfig {
    match target_cluster {
        Some(c) if !c.is_empty() => TransportConfig::Maestro { target_cluster: c },
        _ => TransportConfig::Kubernetes,
    }
}

fn print_objects(output: Output, objs: &[DynamicObject]) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(objs)?),
        Output::Human => {
            for o in objs {
                println!("{}\tgeneration={}", describe(o), generation::get_from(Some(o)));
            }
        }
    }
    Ok(())
}

/// Request context cancelled on Ctrl-C.
fn cancellable_context() -> RequestContext {
    let ctx = RequestContext::new();
    let token = ctx.token().clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            token.cancel();
        }
    });
    ctx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.output);
    init_metrics();

    let settings = ApplySettings::from_env();
    let client = KubeResourceClient::try_default().await.context("connecting to the API server")?;
    let reconciler = Reconciler::from_client(Arc::new(client), settings.clone());
    let ctx = cancellable_context();

    match cli.command {
        Commands::Apply { file, transport, target_cluster, recreate_on_change } => {
            let t0 = Instant::now();
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let rendered = parse_manifest(&bytes, &settings)?;
            let namespace = cli.namespace.clone().or_else(|| rendered.namespace());
            let resource = ManagedResource::new(file.display().to_string(), bytes)
                .with_transport(transport_config(transport, target_cluster)?)
                .with_discovery(DiscoveryConfig::by_name(namespace.as_deref(), rendered.name_any()))
                .recreate_on_change(recreate_on_change);
            info!(file = %file.display(), "apply invoked");
            let out = reconciler.reconcile(&ctx, &resource).await?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
                Output::Human => {
                    println!("{}\t{}", out.result.operation, out.result.reason);
                    if let Some(live) = &out.discovered {
                        println!("{}\tgeneration={}", describe(live), generation::get_from(Some(live)));
                    }
                }
            }
            info!(took_ms = %t0.elapsed().as_millis(), "apply done");
        }
        Commands::Get { gvk, name, target_cluster } => {
            let gvk = parse_gvk_key(&gvk)?;
            let (transport, routing) = reconciler.transport_for(&routing_for(target_cluster))?;
            info!(gvk = %gvk.kind, name = %name, backend = transport.backend(), "get invoked");
            let obj = transport
                .get_resource(&ctx, &gvk, cli.namespace.as_deref(), &name, &routing)
                .await?;
            print_objects(cli.output, std::slice::from_ref(&obj))?;
        }
        Commands::Discover { gvk, name, selector, target_cluster } => {
            let gvk = parse_gvk_key(&gvk)?;
            let ns = cli.namespace.as_deref();
            let discovery = match (name, selector) {
                (Some(n), _) => DiscoveryConfig::by_name(ns, n),
                (None, Some(s)) => DiscoveryConfig::by_selectors(ns, LabelSelector::parse(&s)),
                (None, None) => bail!("discover needs --name or --selector"),
            };
            let (transport, routing) = reconciler.transport_for(&routing_for(target_cluster))?;
            info!(gvk = %gvk.kind, backend = transport.backend(), consumer = ?routing.consumer(), "discover invoked");
            let found = transport.discover_resources(&ctx, &gvk, &discovery, &routing).await?;
            print_objects(cli.output, &found)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maestro_needs_target_cluster() {
        assert!(transport_config(Transport::Maestro, None).is_err());
        assert!(transport_config(Transport::Maestro, Some(String::new())).is_err());
        assert_eq!(
            transport_config(Transport::Maestro, Some("c1".into())).unwrap(),
            TransportConfig::Maestro { target_cluster: "c1".into() }
        );
        assert_eq!(transport_config(Transport::Kubernetes, Some("c1".into())).unwrap(), TransportConfig::Kubernetes);
    }

    #[test]
    fn cli_parses_apply_flags() {
        let cli = Cli::try_parse_from([
            "fleetctl", "-o", "json", "apply", "-f", "m.yaml", "--transport", "maestro", "--target-cluster", "c1",
            "--recreate-on-change",
        ])
        .unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Apply { transport, target_cluster, recreate_on_change, .. } => {
                assert_eq!(transport, Transport::Maestro);
                assert_eq!(target_cluster.as_deref(), Some("c1"));
                assert!(recreate_on_change);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn json_output_logs_less() {
        assert_eq!(default_log_directive(Output::Human), "info");
        assert_eq!(default_log_directive(Output::Json), "warn");
    }

    #[test]
    fn metrics_listener_needs_host_and_port() {
        assert!(metrics_listener("127.0.0.1:9100").is_some());
        assert!(metrics_listener("localhost").is_none());
        assert!(metrics_listener(":9100").is_none());
    }

    #[test]
    fn discover_rejects_name_with_selector() {
        assert!(Cli::try_parse_from(["fleetctl", "discover", "v1/ConfigMap", "--name", "a", "--selector", "x=y"]).is_err());
    }
}
