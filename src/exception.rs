use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ExceptionError;

/* ============================= CONSTANTS ============================= */

pub const EXCEPTION_API_VERSION: &str = "kyverno.io/v2beta1";
pub const EXCEPTION_KIND: &str = "PolicyException";

/// Kinds the engine generates pod rules for.
pub const CONTROLLER_KINDS: &[&str] = &["Deployment", "DaemonSet", "StatefulSet", "CronJob", "Job"];

const AUTOGEN_PREFIX: &str = "autogen-";
const AUTOGEN_CRONJOB_PREFIX: &str = "autogen-cronjob-";

/// Rule properties carrying Pod Security Standard controls.
pub const PROPERTY_CONTROLS: &str = "controls";
pub const PROPERTY_CONTROLS_JSON: &str = "controlsJSON";

const MIN_VERSION: &str = "1.11";
const MIN_VERSION_POD_SECURITY: &str = "1.12";

/* ============================= REQUEST ============================= */

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionResource {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExceptionRule {
    pub name: String,
    /// Result properties of the failing rule, e.g. `controls`.
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

impl ExceptionRule {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            props: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExceptionPolicy {
    /// `name` for a cluster policy, `namespace/name` otherwise.
    pub name: String,
    /// Empty means every rule of the policy.
    #[serde(default)]
    pub rules: Vec<ExceptionRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExceptionRequest {
    pub resource: ExceptionResource,
    #[serde(default)]
    pub policies: Vec<ExceptionPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionResponse {
    /// Oldest engine release that accepts the manifest.
    pub min_version: String,
    /// The PolicyException manifest as YAML.
    pub resource: String,
}

/* ============================= MANIFEST ============================= */

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyException {
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    spec: PolicyExceptionSpec,
}

#[derive(Debug, Serialize)]
struct Metadata {
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    namespace: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyExceptionSpec {
    exceptions: Vec<Exception>,
    #[serde(rename = "match")]
    match_resources: MatchResources,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pod_security: Vec<PodSecurityStandard>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Exception {
    policy_name: String,
    rule_names: Vec<String>,
}

#[derive(Debug, Serialize)]
struct MatchResources {
    any: Vec<ResourceFilter>,
}

#[derive(Debug, Serialize)]
struct ResourceFilter {
    resources: ResourceDescription,
}

#[derive(Debug, Serialize)]
struct ResourceDescription {
    kinds: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    namespaces: Vec<String>,
    names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurityStandard {
    pub control_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Control {
    name: String,
    #[serde(default)]
    images: Vec<String>,
}

/* ============================= BUILD ============================= */

/// Render a PolicyException for `request`. Rule lists must already be
/// resolved; a policy with no rules produces an empty `ruleNames`.
pub fn build(mut request: ExceptionRequest) -> Result<ExceptionResponse, ExceptionError> {
    let resource = &request.resource;
    let mut kinds = vec![resource.kind.clone()];
    let mut pod_security = Vec::new();

    if CONTROLLER_KINDS.contains(&resource.kind.as_str()) {
        kinds.push("Pod".to_string());

        for policy in &mut request.policies {
            expand_autogen(&mut policy.rules);
            pod_security.extend(policy.rules.iter().flat_map(pod_security_controls));
        }
    }

    match resource.kind.as_str() {
        "Deployment" => kinds.push("ReplicaSet".to_string()),
        "CronJob" => kinds.push("Job".to_string()),
        _ => {}
    }

    let min_version = if pod_security.is_empty() {
        MIN_VERSION
    } else {
        MIN_VERSION_POD_SECURITY
    };

    let exception = PolicyException {
        api_version: EXCEPTION_API_VERSION,
        kind: EXCEPTION_KIND,
        metadata: Metadata {
            name: format!("{}-exception", resource.name),
            namespace: resource.namespace.clone(),
        },
        spec: PolicyExceptionSpec {
            exceptions: request
                .policies
                .iter()
                .map(|p| Exception {
                    policy_name: p.name.clone(),
                    rule_names: p.rules.iter().map(|r| r.name.clone()).collect(),
                })
                .collect(),
            match_resources: MatchResources {
                any: vec![ResourceFilter {
                    resources: ResourceDescription {
                        kinds,
                        namespaces: Some(resource.namespace.clone())
                            .filter(|ns| !ns.is_empty())
                            .into_iter()
                            .collect(),
                        names: vec![format!("{}*", resource.name)],
                    },
                }],
            },
            pod_security,
        },
    };

    Ok(ExceptionResponse {
        min_version: min_version.to_string(),
        resource: serde_yaml::to_string(&exception)?,
    })
}

/// Add the names the engine derives from autogen rules so the exception
/// also covers the original pod rule and the Job/CronJob variants.
pub fn expand_autogen(rules: &mut Vec<ExceptionRule>) {
    let mut derived = Vec::new();

    for rule in rules.iter() {
        if let Some(base) = rule.name.strip_prefix(AUTOGEN_CRONJOB_PREFIX) {
            derived.push(format!("{AUTOGEN_PREFIX}{base}"));
            derived.push(base.to_string());
        } else if let Some(base) = rule.name.strip_prefix(AUTOGEN_PREFIX) {
            derived.push(base.to_string());
        }
    }

    for name in derived {
        if !rules.iter().any(|r| r.name == name) {
            rules.push(ExceptionRule::named(name));
        }
    }
}

fn pod_security_controls(rule: &ExceptionRule) -> Vec<PodSecurityStandard> {
    if let Some(raw) = rule.props.get(PROPERTY_CONTROLS_JSON) {
        return match serde_json::from_str::<Vec<Control>>(raw) {
            Ok(controls) => controls
                .into_iter()
                .map(|c| PodSecurityStandard {
                    control_name: c.name,
                    images: c.images.iter().map(|i| wildcard_tag_or_digest(i)).collect(),
                })
                .collect(),
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "pod_security_controls_invalid");
                Vec::new()
            }
        };
    }

    rule.props
        .get(PROPERTY_CONTROLS)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(|c| PodSecurityStandard {
                    control_name: c.to_string(),
                    images: Vec::new(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Replace an image's tag or digest with `*`.
pub fn wildcard_tag_or_digest(image: &str) -> String {
    match image.find([':', '@']) {
        Some(at) => format!("{}*", &image[..at]),
        None => image.to_string(),
    }
}

/* ============================= TESTS ============================= */
