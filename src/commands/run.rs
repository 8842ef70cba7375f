use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::Client;
use tokio::signal;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kyverno_plugin::catalog::KyvernoCatalog;
use kyverno_plugin::config::Config;
use kyverno_plugin::crd::{ClusterPolicyReport, PolicyReport};
use kyverno_plugin::events::EventWatcher;
use kyverno_plugin::kyverno::{KubePolicyClient, PolicyStore};
use kyverno_plugin::leader;
use kyverno_plugin::report::{KubeReportStore, ReportAggregator, ReportStore};
use kyverno_plugin::server::{self, AppState};
use kyverno_plugin::violation::{Publisher, Violation};
use kyverno_plugin::{logging, metrics};

pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub port: Option<u16>,
    pub lease_name: Option<String>,
}

/* ============================= ENTRY ============================= */

pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(name) = args.lease_name {
        config.leader_election.lock_name = name;
    }
    config.validate().context("Invalid configuration")?;

    logging::init(&config.logging);
    metrics::init();

    println!("Starting Kyverno plugin...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let mut auth = config.server.basic_auth.clone();
    if let Err(e) = auth.resolve_secret(client.clone(), &config.namespace).await {
        warn!(secret = %auth.secret_ref, error = %e, "basic_auth_secret_failed");
    }

    let policies: Arc<dyn PolicyStore> = Arc::new(KubePolicyClient::new(client.clone()));
    let catalog = Arc::new(KyvernoCatalog::new(policies.clone()));
    let state = AppState::new(catalog, auth);
    let shutdown = CancellationToken::new();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    println!("  HTTP server ................. {addr}");
    println!("  Policy API .................. /api/v1/policies");
    println!(
        "  Block reports ............... {}",
        if config.block_reports.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "  Leader election ............. {}",
        if config.leader_election.enabled {
            format!("enabled ({})", config.leader_election.lock_name)
        } else {
            "disabled".to_string()
        }
    );
    println!("\nPlugin running. Press Ctrl+C to stop.\n");

    let mut http = tokio::spawn(server::serve(addr, state.clone(), shutdown.clone()));

    let pipeline = config.block_reports.enabled.then(|| {
        tokio::spawn(run_block_reports(
            config.clone(),
            client.clone(),
            policies.clone(),
            shutdown.clone(),
        ))
    });

    state.set_ready(true);
    info!(port = config.server.port, "plugin_started");

    let served = wait_for_exit(&mut http, &shutdown).await;

    state.set_ready(false);
    shutdown.cancel();

    let mut failure = None;
    if let Some(pipeline) = pipeline {
        match pipeline.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failure = Some(e),
            Err(e) => error!(error = %e, "block_report_pipeline_panicked"),
        }
    }

    let served = match served {
        Some(served) => served,
        None => http.await,
    };
    served.context("HTTP server task panicked")??;

    if let Some(e) = failure {
        return Err(e);
    }

    info!("plugin_stopped");
    println!("Plugin stopped.");
    Ok(())
}

/// Returns the HTTP task's outcome when it exits on its own, `None` on
/// Ctrl+C or an internal shutdown.
async fn wait_for_exit(
    http: &mut JoinHandle<Result<()>>,
    shutdown: &CancellationToken,
) -> Option<Result<Result<()>, JoinError>> {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\nShutdown signal received. Stopping plugin...");
            None
        }
        _ = shutdown.cancelled() => None,
        served = http => {
            warn!("http_server_exited");
            Some(served)
        }
    }
}

/* ============================= BLOCK REPORTS ============================= */

async fn run_block_reports(
    config: Config,
    client: Client,
    policies: Arc<dyn PolicyStore>,
    shutdown: CancellationToken,
) -> Result<()> {
    let store = KubeReportStore::new(client.clone());
    let namespaced: Arc<dyn ReportStore<PolicyReport>> = Arc::new(store.clone());
    let cluster: Arc<dyn ReportStore<ClusterPolicyReport>> = Arc::new(store);
    let aggregator = Arc::new(ReportAggregator::new(config.report_settings(), namespaced, cluster));

    let mut publisher = Publisher::new();
    {
        let aggregator = aggregator.clone();
        publisher.register_listener(move |violation: Violation| {
            let aggregator = aggregator.clone();
            async move {
                if let Err(e) = aggregator.process_violation(&violation).await {
                    error!(
                        event = %violation.event.name,
                        policy = %violation.policy.name,
                        error = %e,
                        "process_violation_failed"
                    );
                }
            }
        });
    }
    let publisher = Arc::new(publisher);
    let event_namespace = config.block_reports.event_namespace.clone();

    let task = {
        let client = client.clone();
        leader::gated(move |stop: CancellationToken| {
            let aggregator = aggregator.clone();
            let publisher = publisher.clone();
            let policies = policies.clone();
            let client = client.clone();
            let namespace = event_namespace.clone();

            async move {
                if !aggregator.reconcile_reports(&stop).await {
                    return;
                }

                let watcher = EventWatcher::new(policies, publisher);
                if let Err(e) = watcher.run(client, &namespace, stop).await {
                    error!(error = %e, "event_watcher_failed");
                }
            }
        })
    };

    if !config.leader_election.enabled {
        leader::run_unconditionally(task, shutdown).await;
        return Ok(());
    }

    let election = config.election_config();
    if let Err(e) = leader::run_elected(client, &election, task, shutdown.clone()).await {
        error!(lease = %election.lease_name, error = %e, "leader_election_failed");
        shutdown.cancel();
        return Err(e).context("Leader election failed");
    }
    Ok(())
}
