use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use kube::core::ErrorResponse;
use kyverno_plugin::crd::ReportObject;
use kyverno_plugin::error::StoreError;
use kyverno_plugin::kyverno::{KyvernoPolicy, PolicyInterface, PolicyStore};
use kyverno_plugin::report::ReportStore;
use kyverno_plugin::violation::{EventRef, Policy, Resource, Violation};

/* ============================= REPORT STORE ============================= */

/// In-memory report store with resourceVersion conflict detection.
#[allow(dead_code)]
pub struct MemoryReportStore<R> {
    reports: Mutex<BTreeMap<(String, String), R>>,
    version: AtomicU64,
    fail_create: AtomicBool,
    fail_update: AtomicBool,
    hang_list: AtomicBool,
    concurrent_write: AtomicBool,
    gets: AtomicUsize,
    updates: AtomicUsize,
}

fn key(namespace: Option<&str>, name: &str) -> (String, String) {
    (namespace.unwrap_or_default().to_string(), name.to_string())
}

#[allow(dead_code)]
pub fn forbidden() -> StoreError {
    StoreError::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "forbidden".to_string(),
        reason: "Forbidden".to_string(),
        code: 403,
    }))
}

#[allow(dead_code)]
impl<R: ReportObject> MemoryReportStore<R> {
    pub fn new() -> Self {
        Self {
            reports: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            fail_create: AtomicBool::new(false),
            fail_update: AtomicBool::new(false),
            hang_list: AtomicBool::new(false),
            concurrent_write: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Seed a report as if it already existed in the cluster.
    pub fn insert(&self, mut report: R) {
        report.meta_mut().resource_version = Some(self.next_version());
        let k = key(report.namespace().as_deref(), &report.name_any());
        self.reports.lock().unwrap().insert(k, report);
    }

    pub fn stored(&self, namespace: Option<&str>, name: &str) -> Option<R> {
        self.reports.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn fail_creates(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_updates(&self) {
        self.fail_update.store(true, Ordering::SeqCst);
    }

    /// Make every `list` call pend forever.
    pub fn hang_lists(&self) {
        self.hang_list.store(true, Ordering::SeqCst);
    }

    /// Have another writer touch the stored report right before the next
    /// update lands, so the caller's copy is stale.
    pub fn write_concurrently(&self) {
        self.concurrent_write.store(true, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: ReportObject> ReportStore<R> for MemoryReportStore<R> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<R, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.stored(namespace, name).ok_or(StoreError::NotFound)
    }

    async fn create(&self, report: &R) -> Result<R, StoreError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(forbidden());
        }

        let k = key(report.namespace().as_deref(), &report.name_any());
        let mut reports = self.reports.lock().unwrap();
        if reports.contains_key(&k) {
            return Err(StoreError::Conflict(format!("{} already exists", k.1)));
        }

        let mut created = report.clone();
        created.meta_mut().resource_version = Some(self.next_version());
        reports.insert(k, created.clone());
        Ok(created)
    }

    async fn update(&self, report: &R) -> Result<R, StoreError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(forbidden());
        }

        let k = key(report.namespace().as_deref(), &report.name_any());
        let mut reports = self.reports.lock().unwrap();
        if self.concurrent_write.swap(false, Ordering::SeqCst)
            && let Some(current) = reports.get_mut(&k)
        {
            current.meta_mut().resource_version = Some(self.next_version());
        }
        let Some(current) = reports.get(&k) else {
            return Err(StoreError::NotFound);
        };
        if current.resource_version() != report.resource_version() {
            return Err(StoreError::Conflict(format!("{} has been modified", k.1)));
        }

        let mut updated = report.clone();
        updated.meta_mut().resource_version = Some(self.next_version());
        reports.insert(k, updated.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<R>, StoreError> {
        if self.hang_list.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (label, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        Ok(self
            .reports
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.labels().get(label).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }
}

/* ============================= POLICY STORE ============================= */

/// Fixed set of policies, addressed by namespace and name.
#[allow(dead_code)]
pub struct StaticPolicyStore {
    policies: Vec<KyvernoPolicy>,
    pub lookups: AtomicUsize,
}

#[allow(dead_code)]
impl StaticPolicyStore {
    pub fn new(policies: Vec<KyvernoPolicy>) -> Self {
        Self {
            policies,
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PolicyStore for StaticPolicyStore {
    async fn get_policy(&self, name: &str, namespace: &str) -> Result<KyvernoPolicy, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.policies
            .iter()
            .find(|p| p.name() == name && p.namespace().unwrap_or_default() == namespace)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_policies(&self) -> Result<Vec<KyvernoPolicy>, StoreError> {
        Ok(self.policies.clone())
    }
}

#[allow(dead_code)]
pub const CLUSTER_POLICY_YAML: &str = r#"
apiVersion: kyverno.io/v1
kind: ClusterPolicy
metadata:
  name: require-requests
  annotations:
    policies.kyverno.io/category: Best Practices
    policies.kyverno.io/severity: medium
spec:
  validationFailureAction: Enforce
  rules:
    - name: check-requests
      validate:
        message: "CPU and memory requests are required."
"#;

#[allow(dead_code)]
pub fn make_cluster_policy() -> KyvernoPolicy {
    KyvernoPolicy::Cluster(serde_yaml::from_str(CLUSTER_POLICY_YAML).unwrap())
}

/* ============================= BUILDERS ============================= */

#[allow(dead_code)]
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Violation against `require-requests/check-requests` for a Pod.
#[allow(dead_code)]
pub fn make_violation(event: &str, uid: &str, namespace: &str, secs: i64) -> Violation {
    Violation {
        resource: Resource {
            kind: if namespace.is_empty() { "Namespace" } else { "Pod" }.to_string(),
            namespace: namespace.to_string(),
            name: "nginx".to_string(),
        },
        policy: Policy {
            name: "require-requests".to_string(),
            rule: "check-requests".to_string(),
            message: "CPU and memory requests are required.".to_string(),
            category: "Best Practices".to_string(),
            severity: "medium".to_string(),
        },
        event: EventRef {
            name: event.to_string(),
            uid: uid.to_string(),
        },
        timestamp: at(secs),
        updated: false,
    }
}

/// Admission event as Kyverno emits it for a blocked Pod.
#[allow(dead_code)]
pub fn make_blocked_event(uid: &str, version: &str, created: DateTime<Utc>, last: DateTime<Utc>) -> Event {
    Event {
        metadata: ObjectMeta {
            name: Some(format!("require-requests.{uid}")),
            namespace: Some("default".to_string()),
            uid: Some(uid.to_string()),
            resource_version: Some(version.to_string()),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        },
        involved_object: ObjectReference {
            kind: Some("ClusterPolicy".to_string()),
            name: Some("require-requests".to_string()),
            ..Default::default()
        },
        message: Some(
            "Pod team-a/nginx: [check-requests] fail (blocked); validation error: requests required"
                .to_string(),
        ),
        reason: Some("PolicyViolation".to_string()),
        type_: Some("Warning".to_string()),
        last_timestamp: Some(Time(last)),
        ..Default::default()
    }
}
