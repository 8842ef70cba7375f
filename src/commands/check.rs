use std::path::Path;

use anyhow::Context;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Event;
use kube::api::ListParams;
use kube::{Api, Client};

use kyverno_plugin::config::Config;
use kyverno_plugin::crd::{ClusterPolicyReport, PolicyReport};
use kyverno_plugin::events::field_selector;
use kyverno_plugin::kyverno::{KubePolicyClient, PolicyStore};

pub async fn run(config: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(config).context("Failed to load configuration")?;

    println!("Running cluster connectivity checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    let version = match client.apiserver_version().await {
        Ok(v) => {
            println!("OK (v{}.{})", v.major, v.minor);
            Some(v)
        }
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    };

    // 3. Kyverno policies
    print!("  List Kyverno policies ....... ");
    match KubePolicyClient::new(client.clone()).list_policies().await {
        Ok(policies) => println!("OK ({} policies)", policies.len()),
        Err(e) => println!("FAIL ({})", e),
    }

    // 4. Blocked admission events
    print!("  List events permission ...... ");
    let events: Api<Event> = if config.block_reports.event_namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), &config.block_reports.event_namespace)
    };
    match events
        .list(&ListParams::default().fields(&field_selector()).limit(1))
        .await
    {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    // 5. Report CRDs
    print!("  List policyreports .......... ");
    let reports: Api<PolicyReport> = Api::all(client.clone());
    match reports.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    print!("  List clusterpolicyreports ... ");
    let cluster_reports: Api<ClusterPolicyReport> = Api::all(client.clone());
    match cluster_reports.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    // 6. Lease, only relevant with leader election
    if config.leader_election.enabled {
        print!("  Lease access ................ ");
        let leases: Api<Lease> = Api::namespaced(client.clone(), &config.namespace);
        match leases.get_opt(&config.leader_election.lock_name).await {
            Ok(Some(lease)) => {
                let holder = lease
                    .spec
                    .and_then(|s| s.holder_identity)
                    .unwrap_or_else(|| "none".to_string());
                println!("OK (holder: {})", holder);
            }
            Ok(None) => println!("OK (not created yet)"),
            Err(e) => println!("FAIL ({})", e),
        }
    }

    if let Some(v) = version {
        println!("\n  Kubernetes version: {}.{}", v.major, v.minor);
    }

    println!("\nAll checks completed.");
    Ok(())
}
