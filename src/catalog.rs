use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ExceptionError, StoreError};
use crate::exception::{self, ExceptionRequest, ExceptionResponse, ExceptionRule};
use crate::kyverno::{
    ANNOTATION_DESCRIPTION, ANNOTATION_KYVERNO_VERSION, ANNOTATION_SUBJECT, ANNOTATION_TITLE,
    KyvernoPolicy, PolicyInterface, PolicyStore,
};

/* ============================= CONFIG ============================= */

pub const LIST_CACHE_TTL: Duration = Duration::from_secs(15);
const DEFAULT_CATEGORY: &str = "Other";
const ENGINE_NAME: &str = "Kyverno";

const STRIPPED_METADATA: &[&str] = &[
    "managedFields",
    "creationTimestamp",
    "generation",
    "resourceVersion",
    "uid",
];
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/* ============================= MODEL ============================= */

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyListItem {
    pub category: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub severity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Engine {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCode {
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailsItem {
    pub title: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDetails {
    #[serde(flatten)]
    pub item: PolicyListItem,
    pub engine: Engine,
    pub code: SourceCode,
    pub details: Vec<DetailsItem>,
}

/* ============================= CATALOG ============================= */

/// Read-only view of installed policies for the HTTP API.
#[async_trait]
pub trait PolicyCatalog: Send + Sync {
    async fn list(&self) -> Result<Vec<PolicyListItem>, StoreError>;

    /// `resource` is `name` for a cluster policy or `namespace/name`.
    /// Unknown policies resolve to `None`.
    async fn get(&self, resource: &str) -> Result<Option<PolicyDetails>, StoreError>;

    /// Render a PolicyException for a resource. Policies listed without
    /// rules are excepted from all of their rules.
    async fn exception(&self, request: ExceptionRequest) -> Result<ExceptionResponse, ExceptionError>;
}

struct CachedList {
    loaded_at: Instant,
    items: Vec<PolicyListItem>,
}

pub struct KyvernoCatalog {
    store: Arc<dyn PolicyStore>,
    ttl: Duration,
    cache: RwLock<Option<CachedList>>,
}

impl KyvernoCatalog {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self::with_ttl(store, LIST_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn PolicyStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(None),
        }
    }
}

#[async_trait]
impl PolicyCatalog for KyvernoCatalog {
    async fn list(&self) -> Result<Vec<PolicyListItem>, StoreError> {
        if let Some(cached) = self.cache.read().await.as_ref()
            && cached.loaded_at.elapsed() < self.ttl
        {
            debug!("policy_list_cache_hit");
            return Ok(cached.items.clone());
        }

        let items: Vec<PolicyListItem> = self
            .store
            .list_policies()
            .await?
            .iter()
            .map(list_item)
            .collect();

        *self.cache.write().await = Some(CachedList {
            loaded_at: Instant::now(),
            items: items.clone(),
        });
        debug!(count = items.len(), "policy_list_loaded");

        Ok(items)
    }

    async fn get(&self, resource: &str) -> Result<Option<PolicyDetails>, StoreError> {
        let (namespace, name) = split_resource(resource);

        match self.store.get_policy(name, namespace).await {
            Ok(policy) => Ok(Some(details(&policy))),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn exception(&self, mut request: ExceptionRequest) -> Result<ExceptionResponse, ExceptionError> {
        for policy in request.policies.iter_mut().filter(|p| p.rules.is_empty()) {
            let (namespace, name) = split_resource(&policy.name);

            let resolved = match self.store.get_policy(name, namespace).await {
                Ok(resolved) => resolved,
                Err(StoreError::NotFound) => return Err(ExceptionError::PolicyNotFound(policy.name.clone())),
                Err(e) => return Err(e.into()),
            };
            policy.rules = resolved.rule_names().into_iter().map(ExceptionRule::named).collect();
            debug!(policy = %policy.name, rules = policy.rules.len(), "exception_rules_resolved");
        }

        exception::build(request)
    }
}

/* ============================= MAPPING ============================= */

fn split_resource(resource: &str) -> (&str, &str) {
    let resource = resource.trim_start_matches('/');
    match resource.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => ("", resource),
    }
}

pub fn list_item(policy: &KyvernoPolicy) -> PolicyListItem {
    let name = policy.name();
    let title = match policy.annotation(ANNOTATION_TITLE) {
        Some(title) => title.trim().to_string(),
        None => title_case(&name),
    };

    PolicyListItem {
        category: match policy.category().trim() {
            "" => DEFAULT_CATEGORY.to_string(),
            category => category.to_string(),
        },
        namespace: policy.namespace().unwrap_or_default(),
        title,
        description: annotation(policy, ANNOTATION_DESCRIPTION),
        severity: policy.severity().trim().to_string(),
        name,
    }
}

/// Header fields of the detail view. Unlike the list, nothing is derived:
/// the title falls back to the raw name and a missing category stays empty.
fn details_item(policy: &KyvernoPolicy) -> PolicyListItem {
    let name = policy.name();
    let title = match annotation(policy, ANNOTATION_TITLE) {
        title if title.is_empty() => name.clone(),
        title => title,
    };

    PolicyListItem {
        category: policy.category().trim().to_string(),
        namespace: policy.namespace().unwrap_or_default(),
        title,
        description: annotation(policy, ANNOTATION_DESCRIPTION),
        severity: policy.severity().trim().to_string(),
        name,
    }
}

pub fn details(policy: &KyvernoPolicy) -> PolicyDetails {
    let spec = policy.spec();

    let subjects = policy
        .annotation(ANNOTATION_SUBJECT)
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    PolicyDetails {
        item: details_item(policy),
        engine: Engine {
            name: ENGINE_NAME.to_string(),
            version: annotation(policy, ANNOTATION_KYVERNO_VERSION),
            subjects,
        },
        code: SourceCode {
            content_type: "yaml".to_string(),
            content: source_yaml(policy),
        },
        details: vec![
            detail("Background", bool_string(spec.background)),
            detail("Admission", bool_string(spec.admission)),
            detail("FailurePolicy", spec.failure_policy.clone().unwrap_or_default()),
            detail("Mode", spec.validation_failure_action.clone().unwrap_or_default()),
        ],
    }
}

fn annotation(policy: &KyvernoPolicy, key: &str) -> String {
    policy
        .annotation(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn detail(title: &str, value: String) -> DetailsItem {
    DetailsItem {
        title: title.to_string(),
        value,
    }
}

fn bool_string(value: Option<bool>) -> String {
    match value {
        Some(true) => "enabled".to_string(),
        Some(false) => "disabled".to_string(),
        None => String::new(),
    }
}

/// Policy manifest without server-populated bookkeeping fields.
fn source_yaml(policy: &KyvernoPolicy) -> String {
    let Ok(mut value) = policy.to_value() else {
        return String::new();
    };

    if let Some(Value::Object(metadata)) = value.get_mut("metadata") {
        for key in STRIPPED_METADATA {
            metadata.remove(*key);
        }
        if let Some(Value::Object(annotations)) = metadata.get_mut("annotations") {
            annotations.remove(LAST_APPLIED_ANNOTATION);
        }
    }

    serde_yaml::to_string(&value).unwrap_or_default()
}

/// Upper-case the first letter of every word, leaving the rest untouched.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;

    for c in s.chars() {
        if at_word_start && c.is_alphabetic() {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_word_start = !c.is_alphanumeric();
    }

    out
}

/* ============================= TESTS ============================= */
