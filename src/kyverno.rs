use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::ClusterResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ListParams;
use kube::{Api, Client, CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::retry;

/* ============================= ANNOTATIONS ============================= */

pub const ANNOTATION_TITLE: &str = "policies.kyverno.io/title";
pub const ANNOTATION_DESCRIPTION: &str = "policies.kyverno.io/description";
pub const ANNOTATION_SUBJECT: &str = "policies.kyverno.io/subject";
pub const ANNOTATION_CATEGORY: &str = "policies.kyverno.io/category";
pub const ANNOTATION_SEVERITY: &str = "policies.kyverno.io/severity";
pub const ANNOTATION_KYVERNO_VERSION: &str = "kyverno.io/kyverno-version";
pub const ANNOTATION_KUBERNETES_VERSION: &str = "kyverno.io/kubernetes-version";

/* ============================= SPEC ============================= */

/// Rules and settings shared by `ClusterPolicy` and `Policy`.
///
/// Only the fields this crate reads are typed. Everything else the engine
/// defines is kept verbatim in `extra` so a round trip loses nothing.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kyverno.io",
    version = "v1",
    kind = "Policy",
    plural = "policies",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub rules: Vec<Rule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_failure_action: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Rule {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<Validation>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Rule {
    /// The rule's validation message, if it has a non-empty one.
    pub fn validation_message(&self) -> Option<&str> {
        self.validate
            .as_ref()
            .map(|v| v.message.as_str())
            .filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Validation {
    #[serde(default)]
    pub message: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/* ============================= STATUS ============================= */

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PolicyStatus {
    /// Rules generated by the engine for pod controllers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autogen: Option<AutogenStatus>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AutogenStatus {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/* ============================= CLUSTER POLICY ============================= */

/// Cluster-scoped variant. Same schema as `Policy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicy {
    #[serde(default = "cluster_policy_api_version")]
    pub api_version: String,
    #[serde(default = "cluster_policy_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PolicySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PolicyStatus>,
}

fn cluster_policy_api_version() -> String {
    "kyverno.io/v1".to_string()
}

fn cluster_policy_kind() -> String {
    "ClusterPolicy".to_string()
}

impl ClusterPolicy {
    pub fn new(name: &str, spec: PolicySpec) -> Self {
        Self {
            api_version: cluster_policy_api_version(),
            kind: cluster_policy_kind(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }
}

impl Resource for ClusterPolicy {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "ClusterPolicy".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "kyverno.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "clusterpolicies".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/* ============================= COMMON INTERFACE ============================= */

/// Read access shared by every policy shape.
pub trait PolicyInterface {
    fn name(&self) -> String;
    fn namespace(&self) -> Option<String>;
    fn annotations(&self) -> &BTreeMap<String, String>;
    fn spec(&self) -> &PolicySpec;
    fn autogen_rules(&self) -> &[Rule];
}

fn autogen(status: &Option<PolicyStatus>) -> &[Rule] {
    status
        .as_ref()
        .and_then(|s| s.autogen.as_ref())
        .map(|a| a.rules.as_slice())
        .unwrap_or_default()
}

impl PolicyInterface for Policy {
    fn name(&self) -> String {
        self.name_any()
    }

    fn namespace(&self) -> Option<String> {
        ResourceExt::namespace(self)
    }

    fn annotations(&self) -> &BTreeMap<String, String> {
        ResourceExt::annotations(self)
    }

    fn spec(&self) -> &PolicySpec {
        &self.spec
    }

    fn autogen_rules(&self) -> &[Rule] {
        autogen(&self.status)
    }
}

impl PolicyInterface for ClusterPolicy {
    fn name(&self) -> String {
        self.name_any()
    }

    fn namespace(&self) -> Option<String> {
        None
    }

    fn annotations(&self) -> &BTreeMap<String, String> {
        ResourceExt::annotations(self)
    }

    fn spec(&self) -> &PolicySpec {
        &self.spec
    }

    fn autogen_rules(&self) -> &[Rule] {
        autogen(&self.status)
    }
}

/// Either policy shape, resolved by scope.
#[derive(Debug, Clone)]
pub enum KyvernoPolicy {
    Cluster(ClusterPolicy),
    Namespaced(Policy),
}

impl KyvernoPolicy {
    fn inner(&self) -> &dyn PolicyInterface {
        match self {
            KyvernoPolicy::Cluster(p) => p,
            KyvernoPolicy::Namespaced(p) => p,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KyvernoPolicy::Cluster(_) => "ClusterPolicy",
            KyvernoPolicy::Namespaced(_) => "Policy",
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn category(&self) -> &str {
        self.annotation(ANNOTATION_CATEGORY).unwrap_or_default()
    }

    pub fn severity(&self) -> &str {
        self.annotation(ANNOTATION_SEVERITY).unwrap_or_default()
    }

    /// Message of the named rule, searching declared rules before the
    /// generated ones.
    pub fn validation_message(&self, rule: &str) -> Option<&str> {
        self.spec()
            .rules
            .iter()
            .chain(self.autogen_rules())
            .filter(|r| r.name == rule)
            .find_map(Rule::validation_message)
    }

    /// Names of declared rules followed by generated ones.
    pub fn rule_names(&self) -> Vec<String> {
        self.spec()
            .rules
            .iter()
            .chain(self.autogen_rules())
            .map(|r| r.name.clone())
            .collect()
    }

    /// Serialize the full object, including type information.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            KyvernoPolicy::Cluster(p) => serde_json::to_value(p),
            KyvernoPolicy::Namespaced(p) => serde_json::to_value(p),
        }
    }
}

impl PolicyInterface for KyvernoPolicy {
    fn name(&self) -> String {
        self.inner().name()
    }

    fn namespace(&self) -> Option<String> {
        self.inner().namespace()
    }

    fn annotations(&self) -> &BTreeMap<String, String> {
        self.inner().annotations()
    }

    fn spec(&self) -> &PolicySpec {
        self.inner().spec()
    }

    fn autogen_rules(&self) -> &[Rule] {
        self.inner().autogen_rules()
    }
}

/* ============================= STORE ============================= */

/// Read access to Kyverno policies in the cluster.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// An empty `namespace` addresses a `ClusterPolicy`.
    async fn get_policy(&self, name: &str, namespace: &str) -> Result<KyvernoPolicy, StoreError>;

    /// All cluster policies followed by all namespaced policies.
    async fn list_policies(&self) -> Result<Vec<KyvernoPolicy>, StoreError>;
}

#[derive(Clone)]
pub struct KubePolicyClient {
    client: Client,
}

impl KubePolicyClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PolicyStore for KubePolicyClient {
    async fn get_policy(&self, name: &str, namespace: &str) -> Result<KyvernoPolicy, StoreError> {
        if namespace.is_empty() {
            let api: Api<ClusterPolicy> = Api::all(self.client.clone());
            let api = &api;
            let policy = retry::kube(move || async move { Ok(api.get(name).await?) }).await?;
            return Ok(KyvernoPolicy::Cluster(policy));
        }

        let api: Api<Policy> = Api::namespaced(self.client.clone(), namespace);
        let api = &api;
        let policy = retry::kube(move || async move { Ok(api.get(name).await?) }).await?;
        Ok(KyvernoPolicy::Namespaced(policy))
    }

    async fn list_policies(&self) -> Result<Vec<KyvernoPolicy>, StoreError> {
        let cluster: Api<ClusterPolicy> = Api::all(self.client.clone());
        let namespaced: Api<Policy> = Api::all(self.client.clone());
        let (cluster, namespaced) = (&cluster, &namespaced);
        let lp = &ListParams::default();

        let cpols = retry::kube(move || async move { Ok(cluster.list(lp).await?) }).await?;
        let pols = retry::kube(move || async move { Ok(namespaced.list(lp).await?) }).await?;

        Ok(cpols
            .items
            .into_iter()
            .map(KyvernoPolicy::Cluster)
            .chain(pols.items.into_iter().map(KyvernoPolicy::Namespaced))
            .collect())
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY_YAML: &str = r#"
apiVersion: kyverno.io/v1
kind: ClusterPolicy
metadata:
  name: require-requests
  annotations:
    policies.kyverno.io/category: Best Practices
    policies.kyverno.io/severity: medium
spec:
  validationFailureAction: Enforce
  background: true
  rules:
    - name: check-requests
      match:
        any:
          - resources:
              kinds: [Pod]
      validate:
        message: "CPU and memory requests are required."
        pattern:
          spec:
            containers:
              - resources:
                  requests:
                    memory: "?*"
status:
  autogen:
    rules:
      - name: autogen-check-requests
        validate:
          message: "Pod controllers need requests too."
"#;

    fn cluster_policy() -> KyvernoPolicy {
        KyvernoPolicy::Cluster(serde_yaml::from_str(POLICY_YAML).expect("valid policy yaml"))
    }

    #[test]
    fn test_annotations_resolve_category_and_severity() {
        let policy = cluster_policy();
        assert_eq!(policy.category(), "Best Practices");
        assert_eq!(policy.severity(), "medium");
        assert_eq!(policy.kind(), "ClusterPolicy");
        assert_eq!(policy.namespace(), None);
    }

    #[test]
    fn test_validation_message_from_declared_rule() {
        let policy = cluster_policy();
        assert_eq!(
            policy.validation_message("check-requests"),
            Some("CPU and memory requests are required.")
        );
    }

    #[test]
    fn test_validation_message_from_autogen_rule() {
        let policy = cluster_policy();
        assert_eq!(
            policy.validation_message("autogen-check-requests"),
            Some("Pod controllers need requests too.")
        );
    }

    #[test]
    fn test_validation_message_unknown_rule() {
        assert_eq!(cluster_policy().validation_message("missing"), None);
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let policy = cluster_policy();
        let value = policy.to_value().expect("should serialize");

        assert_eq!(value["kind"], "ClusterPolicy");
        assert_eq!(value["spec"]["validationFailureAction"], "Enforce");
        assert_eq!(value["spec"]["rules"][0]["match"]["any"][0]["resources"]["kinds"][0], "Pod");
        assert!(value["spec"]["rules"][0]["validate"]["pattern"].is_object());
    }

    #[test]
    fn test_namespaced_policy_shape() {
        let mut policy = Policy::new("disallow-latest", PolicySpec::default());
        policy.metadata.namespace = Some("team-a".to_string());
        let policy = KyvernoPolicy::Namespaced(policy);

        assert_eq!(policy.kind(), "Policy");
        assert_eq!(policy.namespace().as_deref(), Some("team-a"));
        assert_eq!(policy.category(), "");
        assert!(policy.autogen_rules().is_empty());
    }

    #[test]
    fn test_empty_validation_message_is_ignored() {
        let rule = Rule {
            name: "r".to_string(),
            validate: Some(Validation::default()),
            ..Default::default()
        };
        assert_eq!(rule.validation_message(), None);
    }
}
