use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/* ============================= CONSTANTS ============================= */

pub const GROUP: &str = "wgpolicyk8s.io";
pub const VERSION: &str = "v1alpha2";

/// Result value written for every blocked admission.
pub const RESULT_FAIL: &str = "fail";

/* ============================= RESULT ============================= */

/// Seconds/nanos pair as stored by the PolicyReport schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    #[serde(default)]
    pub nanos: i32,
}

/// One entry of a report, corresponding to one violation occurrence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReportResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    pub policy: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default)]
    pub result: String,

    #[serde(default)]
    pub scored: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ObjectReference>,

    #[serde(default)]
    pub timestamp: Timestamp,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl PolicyReportResult {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Per-outcome counters. Only `fail` is ever written by this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReportSummary {
    #[serde(default)]
    pub pass: i32,
    #[serde(default)]
    pub fail: i32,
    #[serde(default)]
    pub warn: i32,
    #[serde(default)]
    pub error: i32,
    #[serde(default)]
    pub skip: i32,
}

/* ============================= REPORT OBJECTS ============================= */

/// Namespaced report of blocked admissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReport {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ObjectReference>,
    #[serde(default)]
    pub summary: PolicyReportSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<PolicyReportResult>,
}

/// Cluster-wide report of blocked admissions against cluster-scoped objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicyReport {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ObjectReference>,
    #[serde(default)]
    pub summary: PolicyReportSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<PolicyReportResult>,
}

impl Resource for PolicyReport {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "PolicyReport".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "policyreports".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for ClusterPolicyReport {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "ClusterPolicyReport".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "clusterpolicyreports".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/* ============================= COMMON ACCESS ============================= */

/// Shared surface of `PolicyReport` and `ClusterPolicyReport` so the
/// aggregation logic is written once for both scopes.
pub trait ReportObject:
    Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Scope label used in logs and metrics.
    const SCOPE: &'static str;

    /// Api handle for reports in `namespace`, or across all namespaces.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;

    /// Empty report carrying the given identity and ownership metadata.
    fn empty(
        name: &str,
        namespace: Option<&str>,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Self;

    fn results(&self) -> &[PolicyReportResult];
    fn results_mut(&mut self) -> &mut Vec<PolicyReportResult>;
    fn summary(&self) -> &PolicyReportSummary;
    fn summary_mut(&mut self) -> &mut PolicyReportSummary;
}

fn report_meta(
    name: &str,
    namespace: Option<&str>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

impl ReportObject for PolicyReport {
    const SCOPE: &'static str = "namespaced";

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }

    fn empty(
        name: &str,
        namespace: Option<&str>,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        Self {
            api_version: <Self as Resource>::api_version(&()).into_owned(),
            kind: <Self as Resource>::kind(&()).into_owned(),
            metadata: report_meta(name, namespace, labels, annotations),
            ..Default::default()
        }
    }

    fn results(&self) -> &[PolicyReportResult] {
        &self.results
    }

    fn results_mut(&mut self) -> &mut Vec<PolicyReportResult> {
        &mut self.results
    }

    fn summary(&self) -> &PolicyReportSummary {
        &self.summary
    }

    fn summary_mut(&mut self) -> &mut PolicyReportSummary {
        &mut self.summary
    }
}

impl ReportObject for ClusterPolicyReport {
    const SCOPE: &'static str = "cluster";

    fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
        Api::all(client)
    }

    fn empty(
        name: &str,
        _namespace: Option<&str>,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        Self {
            api_version: <Self as Resource>::api_version(&()).into_owned(),
            kind: <Self as Resource>::kind(&()).into_owned(),
            metadata: report_meta(name, None, labels, annotations),
            ..Default::default()
        }
    }

    fn results(&self) -> &[PolicyReportResult] {
        &self.results
    }

    fn results_mut(&mut self) -> &mut Vec<PolicyReportResult> {
        &mut self.results
    }

    fn summary(&self) -> &PolicyReportSummary {
        &self.summary
    }

    fn summary_mut(&mut self) -> &mut PolicyReportSummary {
        &mut self.summary
    }
}

/* ============================= TESTS ============================= */
