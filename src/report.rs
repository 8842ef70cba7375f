use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, PostParams};
use kube::{Client, ResourceExt};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crd::{
    ClusterPolicyReport, PolicyReport, PolicyReportResult, PolicyReportSummary, RESULT_FAIL,
    ReportObject, Timestamp,
};
use crate::error::StoreError;
use crate::metrics;
use crate::retry;
use crate::violation::Violation;

/* ============================= CONSTANTS ============================= */

pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "policy-reporter-kyverno-plugin";

pub const CLUSTER_REPORT_NAME: &str = "cpolr-blocked";
const MAX_NAME_LENGTH: usize = 63;

pub const PROPERTY_EVENT_NAME: &str = "eventName";
pub const PROPERTY_RESULT_ID: &str = "resultID";
pub const PROPERTY_TIME: &str = "time";

/// Label selector matching every report this process owns.
pub fn ownership_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}

/// Deterministic name of the namespaced report for `namespace`.
pub fn policy_report_name(namespace: &str) -> String {
    let mut name = format!("polr-ns-{namespace}-blocked");
    name.truncate(MAX_NAME_LENGTH);
    name
}

/// Stable identity of one occurrence of an event.
pub fn result_id(event_uid: &str, timestamp: DateTime<Utc>) -> String {
    let digest = Sha256::digest(format!("{event_uid}{}", timestamp.timestamp()));
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

pub fn build_result(violation: &Violation, source: &str) -> PolicyReportResult {
    let resource = &violation.resource;

    PolicyReportResult {
        source: source.to_string(),
        policy: violation.policy.name.clone(),
        rule: violation.policy.rule.clone(),
        category: violation.policy.category.clone(),
        severity: violation.policy.severity.clone(),
        message: violation.policy.message.clone(),
        result: RESULT_FAIL.to_string(),
        scored: false,
        resources: vec![ObjectReference {
            kind: Some(resource.kind.clone()),
            namespace: Some(resource.namespace.clone()).filter(|ns| !ns.is_empty()),
            name: Some(resource.name.clone()),
            ..Default::default()
        }],
        timestamp: Timestamp {
            seconds: violation.timestamp.timestamp(),
            nanos: 0,
        },
        properties: BTreeMap::from([
            (PROPERTY_EVENT_NAME.to_string(), violation.event.name.clone()),
            (
                PROPERTY_RESULT_ID.to_string(),
                result_id(&violation.event.uid, violation.timestamp),
            ),
            (
                PROPERTY_TIME.to_string(),
                violation.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ]),
    }
}

/* ============================= SETTINGS ============================= */

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub max_results: usize,
    pub source: String,
    pub keep_only_latest: bool,
    /// Target label set, always including the ownership marker.
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl ReportSettings {
    pub fn new(
        max_results: usize,
        source: impl Into<String>,
        keep_only_latest: bool,
        mut labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        Self {
            max_results: max_results.max(1),
            source: source.into(),
            keep_only_latest,
            labels,
            annotations,
        }
    }
}

/* ============================= FOLDING ============================= */

/// Converge `meta` labels and annotations to exactly the target sets.
/// Returns whether anything changed.
pub fn reconcile_metadata(
    meta: &mut ObjectMeta,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> bool {
    fn converge(current: &mut Option<BTreeMap<String, String>>, target: &BTreeMap<String, String>) -> bool {
        let current = current.get_or_insert_with(BTreeMap::new);
        if current == target {
            return false;
        }
        *current = target.clone();
        true
    }

    let labels_changed = converge(&mut meta.labels, labels);
    let annotations_changed = converge(&mut meta.annotations, annotations);
    labels_changed || annotations_changed
}

fn recompute_summary(results: &[PolicyReportResult]) -> PolicyReportSummary {
    let mut summary = PolicyReportSummary::default();
    for result in results {
        match result.result.as_str() {
            "pass" => summary.pass += 1,
            "fail" => summary.fail += 1,
            "warn" => summary.warn += 1,
            "error" => summary.error += 1,
            "skip" => summary.skip += 1,
            _ => {}
        }
    }
    summary
}

/// Result of folding one violation into a report held in memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fold {
    /// The result was appended; the report must be persisted.
    Appended { evicted: usize, collapsed: bool },
    /// An identical occurrence is already stored; nothing to persist.
    Duplicate,
}

/// Apply one violation to `report`: collapse the previous entry for the same
/// event when configured, suppress exact duplicates, evict the oldest
/// entries to stay within `max_results`, then append.
pub fn fold_violation<R: ReportObject>(report: &mut R, violation: &Violation, settings: &ReportSettings) -> Fold {
    let candidate = build_result(violation, &settings.source);
    let candidate_id = candidate.property(PROPERTY_RESULT_ID).map(str::to_string);

    let mut results = report.results().to_vec();

    let mut collapsed = false;
    if violation.updated
        && settings.keep_only_latest
        && let Some(index) = results
            .iter()
            .position(|r| r.property(PROPERTY_EVENT_NAME) == Some(violation.event.name.as_str()))
    {
        results.remove(index);
        collapsed = true;
    }

    if results
        .iter()
        .any(|r| r.property(PROPERTY_RESULT_ID) == candidate_id.as_deref())
    {
        return Fold::Duplicate;
    }

    let max = settings.max_results.max(1);
    let evicted = (results.len() + 1).saturating_sub(max);
    results.drain(..evicted);
    results.push(candidate);

    *report.summary_mut() = recompute_summary(&results);
    *report.results_mut() = results;

    Fold::Appended { evicted, collapsed }
}

/* ============================= STORE ============================= */

/// Cluster store surface for one report kind.
#[async_trait]
pub trait ReportStore<R: ReportObject>: Send + Sync {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<R, StoreError>;
    async fn create(&self, report: &R) -> Result<R, StoreError>;
    /// Optimistic replace; a stale resourceVersion yields `StoreError::Conflict`.
    async fn update(&self, report: &R) -> Result<R, StoreError>;
    async fn list(&self, label_selector: &str) -> Result<Vec<R>, StoreError>;
}

#[derive(Clone)]
pub struct KubeReportStore {
    client: Client,
}

impl KubeReportStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<R: ReportObject> ReportStore<R> for KubeReportStore {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<R, StoreError> {
        let api = &R::api(self.client.clone(), namespace);
        retry::kube(move || async move { Ok(api.get(name).await?) }).await
    }

    async fn create(&self, report: &R) -> Result<R, StoreError> {
        let api = &R::api(self.client.clone(), report.namespace().as_deref());
        let pp = &PostParams::default();
        retry::kube(move || async move { Ok(api.create(pp, report).await?) }).await
    }

    async fn update(&self, report: &R) -> Result<R, StoreError> {
        let api = &R::api(self.client.clone(), report.namespace().as_deref());
        let pp = &PostParams::default();
        let name = &report.name_any();
        retry::kube(move || async move { Ok(api.replace(name, pp, report).await?) }).await
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<R>, StoreError> {
        let api = &R::api(self.client.clone(), None);
        let lp = &ListParams::default().labels(label_selector);
        let list = retry::kube(move || async move { Ok(api.list(lp).await?) }).await?;
        Ok(list.items)
    }
}

/* ============================= AGGREGATOR ============================= */

/// What a single `process_violation` call did to the cluster store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Updated,
    Unchanged,
}

/// Folds violations into namespaced and cluster reports.
pub struct ReportAggregator {
    settings: ReportSettings,
    namespaced: Arc<dyn ReportStore<PolicyReport>>,
    cluster: Arc<dyn ReportStore<ClusterPolicyReport>>,
}

impl ReportAggregator {
    pub fn new(
        settings: ReportSettings,
        namespaced: Arc<dyn ReportStore<PolicyReport>>,
        cluster: Arc<dyn ReportStore<ClusterPolicyReport>>,
    ) -> Self {
        Self {
            settings,
            namespaced,
            cluster,
        }
    }

    pub fn settings(&self) -> &ReportSettings {
        &self.settings
    }

    /// Route the violation to its report, create the report on first use,
    /// fold the violation in and persist.
    pub async fn process_violation(&self, violation: &Violation) -> Result<Processed, StoreError> {
        if violation.is_cluster_scoped() {
            self.process_in(self.cluster.as_ref(), None, CLUSTER_REPORT_NAME, violation)
                .await
        } else {
            let namespace = violation.resource.namespace.as_str();
            self.process_in(
                self.namespaced.as_ref(),
                Some(namespace),
                &policy_report_name(namespace),
                violation,
            )
            .await
        }
    }

    async fn process_in<R: ReportObject>(
        &self,
        store: &dyn ReportStore<R>,
        namespace: Option<&str>,
        name: &str,
        violation: &Violation,
    ) -> Result<Processed, StoreError> {
        let result = self.fetch_and_fold(store, namespace, name, violation).await;
        let outcome = match &result {
            Ok(Processed::Updated) => "updated",
            Ok(Processed::Unchanged) => "unchanged",
            Err(_) => "error",
        };
        metrics::REPORT_WRITES
            .with_label_values(&[R::SCOPE, outcome])
            .inc();
        result
    }

    async fn fetch_and_fold<R: ReportObject>(
        &self,
        store: &dyn ReportStore<R>,
        namespace: Option<&str>,
        name: &str,
        violation: &Violation,
    ) -> Result<Processed, StoreError> {
        let mut report = match store.get(namespace, name).await {
            Ok(mut report) => {
                reconcile_metadata(report.meta_mut(), &self.settings.labels, &self.settings.annotations);
                report
            }
            Err(StoreError::NotFound) => {
                let empty = R::empty(
                    name,
                    namespace,
                    self.settings.labels.clone(),
                    self.settings.annotations.clone(),
                );
                let created = store.create(&empty).await.inspect_err(|e| {
                    warn!(scope = R::SCOPE, report = %name, error = %e, "report_create_failed");
                })?;
                metrics::REPORT_WRITES
                    .with_label_values(&[R::SCOPE, "created"])
                    .inc();
                info!(scope = R::SCOPE, report = %name, "report_created");
                created
            }
            Err(e) => return Err(e),
        };

        match fold_violation(&mut report, violation, &self.settings) {
            Fold::Duplicate => {
                debug!(report = %name, event = %violation.event.name, "duplicate_result_skipped");
                return Ok(Processed::Unchanged);
            }
            Fold::Appended { evicted, collapsed } => {
                debug!(report = %name, evicted, collapsed, "result_appended");
            }
        }

        let stored = store.update(&report).await?;
        metrics::REPORT_RESULTS
            .with_label_values(&[R::SCOPE, namespace.unwrap_or_default()])
            .set(stored.results().len() as i64);
        debug!(
            scope = R::SCOPE,
            report = %name,
            results = stored.results().len(),
            "report_updated"
        );

        Ok(Processed::Updated)
    }

    /// Converge labels and annotations of every owned namespaced report.
    pub async fn update_policy_reports(&self) -> Result<usize, StoreError> {
        self.reconcile_all(self.namespaced.as_ref()).await
    }

    /// Converge labels and annotations of every owned cluster report.
    pub async fn update_cluster_policy_reports(&self) -> Result<usize, StoreError> {
        self.reconcile_all(self.cluster.as_ref()).await
    }

    /// Run both passes side by side, logging their errors. Returns `false`
    /// if `stop` fires before they are done.
    pub async fn reconcile_reports(&self, stop: &CancellationToken) -> bool {
        let passes = async {
            let (namespaced, cluster) = tokio::join!(
                self.update_policy_reports(),
                self.update_cluster_policy_reports()
            );
            if let Err(e) = namespaced {
                error!(error = %e, "policy_report_reconcile_failed");
            }
            if let Err(e) = cluster {
                error!(error = %e, "cluster_policy_report_reconcile_failed");
            }
        };

        tokio::select! {
            _ = stop.cancelled() => {
                info!("report_reconcile_cancelled");
                false
            }
            _ = passes => true,
        }
    }

    async fn reconcile_all<R: ReportObject>(&self, store: &dyn ReportStore<R>) -> Result<usize, StoreError> {
        let reports = store.list(&ownership_selector()).await?;
        let mut updated = 0;

        for mut report in reports {
            if !reconcile_metadata(report.meta_mut(), &self.settings.labels, &self.settings.annotations) {
                continue;
            }

            let name = report.name_any();
            match store.update(&report).await {
                Ok(_) => {
                    updated += 1;
                    info!(scope = R::SCOPE, report = %name, "report_metadata_reconciled");
                }
                Err(e) => {
                    warn!(scope = R::SCOPE, report = %name, error = %e, "report_metadata_update_failed");
                }
            }
        }

        Ok(updated)
    }
}

/* ============================= TESTS ============================= */
