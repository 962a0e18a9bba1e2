use clap::Parser;
use eyre::format_err;
use kube::{Client, runtime::watcher};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};

use kmnp::netpol::nftables::CommonRules;
use kmnp::{agent, cri, kube_watch};

/// Kubernetes Multi-NetworkPolicy nftables agent
#[derive(Parser)]
#[command(version, about, long_about = ABOUT)]
struct Cli {
    /// log filters (see https://docs.rs/env_logger/latest/env_logger/index.html#enabling-logging)
    #[arg(long, default_value = "info", env = "KMNP_LOG")]
    log: String,
    /// log style (see https://docs.rs/env_logger/latest/env_logger/index.html#disabling-colors)
    #[arg(long, default_value = "auto", env = "KMNP_LOG_STYLE")]
    log_style: String,

    /// my node name (hint: {valueFrom: {fieldRef: { fieldPath: spec.nodeName }}})
    #[arg(
        long,
        env = "NODE_NAME",
        default_value_t = default_nodename()
    )]
    hostname_override: String,

    /// Kubernetes API server URL, overriding the inferred configuration
    #[arg(long)]
    cluster_url: Option<String>,

    /// Namespace to watch for policies instead of the whole cluster.
    #[arg(long)]
    namespace: Option<String>,

    /// comma-separated list of CNI plugin types considered for enforcement
    #[arg(long, default_value = "macvlan")]
    network_plugins: String,

    /// path to the CRI socket
    #[arg(long)]
    container_runtime_endpoint: String,

    /// prefix for host filesystem paths, when running containerized
    #[arg(long)]
    host_prefix: Option<PathBuf>,

    /// accept all ICMP traffic
    #[arg(long)]
    accept_icmp: bool,

    /// accept all ICMPv6 traffic
    #[arg(long)]
    accept_icmpv6: bool,

    /// custom rule file for IPv4 ingress
    #[arg(long)]
    custom_v4_ingress_rule_file: Option<PathBuf>,

    /// custom rule file for IPv4 egress
    #[arg(long)]
    custom_v4_egress_rule_file: Option<PathBuf>,

    /// custom rule file for IPv6 ingress
    #[arg(long)]
    custom_v6_ingress_rule_file: Option<PathBuf>,

    /// custom rule file for IPv6 egress
    #[arg(long)]
    custom_v6_egress_rule_file: Option<PathBuf>,

    /// Kubernetes watch events buffer size
    #[arg(long, default_value_t = 100)]
    event_buffer: usize,
}

const ABOUT: &'static str = r#"
Kubernetes Multi-NetworkPolicy nftables agent

Watch MultiNetworkPolicy, pod and namespace objects and enforce policies on
pods' secondary network interfaces, as nftables rulesets installed inside
each pod's network namespace. The default pod network is left alone.
"#;

fn default_nodename() -> String {
    gethostname::gethostname()
        .into_string()
        .map_err(|s| format_err!("invalid hostname: {s:?}"))
        .unwrap()
}

type Tasks = tokio::task::JoinSet<(String, eyre::Result<()>)>;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .parse_filters(cli.log.as_str())
        .parse_write_style(cli.log_style.as_str())
        .format_timestamp_millis()
        .init();

    let valid_plugins: Vec<String> = (cli.network_plugins.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();
    if valid_plugins.is_empty() {
        return Err(format_err!("no network plugins provided"));
    }
    info!("valid network plugins: {}", valid_plugins.join(", "));

    let common_rules = load_common_rules(&cli).await?;

    let cluster_url: Option<http::Uri> = match cli.cluster_url {
        None => None,
        Some(ref v) => Some(
            v.parse()
                .map_err(|e| format_err!("invalid cluster_url: {e}"))?,
        ),
    };

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        select! {
            _ = sigterm.recv() => println!("Received SIGTERM"),
            _ = sigint.recv() => println!("Received SIGINT"),
        };
        exit(0);
    });

    info!(
        "kmnp {} ({}) starting as node {}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT"),
        cli.hostname_override
    );

    let mut kube_cfg = kube::Config::infer().await?;
    if let Some(cluster_url) = cluster_url {
        kube_cfg.cluster_url = cluster_url;
    }

    info!("kubernetes cluster at {}", kube_cfg.cluster_url);

    let kube: Client = kube_cfg.try_into()?;

    match &cli.namespace {
        None => info!("watching all namespaces"),
        Some(ns) => info!("watching namespace {ns}"),
    };

    let ctx = Arc::new(kmnp::Context {
        node_name: cli.hostname_override,
        namespace: cli.namespace,
        kube,
    });

    let watch_config = kube_watch::Config {
        client: ctx.kube.clone(),
        watcher_config: watcher::Config::default(),
        namespace: ctx.namespace.clone(),
    };

    let resolver = Arc::new(cri::CriResolver::new(
        cli.container_runtime_endpoint,
        cli.host_prefix,
    ));

    let source = kmnp::watcher::Source::new(ctx.node_name.clone());

    let mut tasks = Tasks::new();

    let agent_cfg = agent::Config {
        common_rules,
        valid_plugins,
    };
    let agent_watcher = source.new_watcher();
    let agent_ctx = ctx.clone();
    tasks.spawn(async move {
        (
            "netpol".to_string(),
            agent::watch(agent_ctx, agent_cfg, resolver, agent_watcher).await,
        )
    });

    tokio::spawn(kmnp::process_kube_events(
        source,
        watch_config,
        cli.event_buffer,
    ));

    while let Some(res) = tasks.join_next().await {
        match res {
            Err(e) => {
                error!("task wait failed: {e}");
            }
            Ok((name, Ok(_))) => {
                info!("task {name} finished");
                continue;
            }
            Ok((name, Err(e))) => {
                error!("task {name} finished with error: {e}");
            }
        }
        exit(1);
    }

    error!("all tasks finished");
    exit(1); // this is actually unexpected
}

async fn load_common_rules(cli: &Cli) -> eyre::Result<CommonRules> {
    Ok(CommonRules {
        accept_icmp: cli.accept_icmp,
        accept_icmpv6: cli.accept_icmpv6,
        custom_v4_ingress: read_rules_file(cli.custom_v4_ingress_rule_file.as_deref()).await?,
        custom_v4_egress: read_rules_file(cli.custom_v4_egress_rule_file.as_deref()).await?,
        custom_v6_ingress: read_rules_file(cli.custom_v6_ingress_rule_file.as_deref()).await?,
        custom_v6_egress: read_rules_file(cli.custom_v6_egress_rule_file.as_deref()).await?,
    })
}

/// Read raw nftables rules from a file, one per line; empty lines and `#`
/// comments are skipped.
async fn read_rules_file(path: Option<&Path>) -> eyre::Result<Vec<String>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format_err!("read rules failed: {}: {e}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}
