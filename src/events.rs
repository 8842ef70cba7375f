use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Event;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::kyverno::{KyvernoPolicy, PolicyInterface, PolicyStore};
use crate::metrics;
use crate::violation::{EventRef, Policy, Publisher, Resource, Violation};

/* ============================= CONSTANTS ============================= */

pub const ADMISSION_SOURCE: &str = "kyverno-admission";
pub const VIOLATION_REASON: &str = "PolicyViolation";
pub const WARNING_TYPE: &str = "Warning";

/// Only events carrying this marker describe a rejected request.
pub const BLOCKED_MARKER: &str = "(blocked)";

/// Server-side filter for admission-denial events.
pub fn field_selector() -> String {
    format!("source={ADMISSION_SOURCE},reason={VIOLATION_REASON},type={WARNING_TYPE}")
}

/* ============================= PARSING ============================= */

/// Fields recovered from `"<Kind> [<namespace>/]<name>: [<rule>] ..."`.
/// Missing segments come back empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub rule: String,
}

pub fn parse_message(message: &str) -> ParsedMessage {
    let mut tokens = message.split_whitespace();

    let kind = tokens.next().unwrap_or_default();

    let resource = tokens.next().unwrap_or_default();
    let resource = resource.strip_suffix(':').unwrap_or(resource);
    let (namespace, name) = resource.split_once('/').unwrap_or(("", resource));

    let rule = tokens.next().unwrap_or_default();
    let rule = rule
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .unwrap_or_default();

    ParsedMessage {
        kind: kind.trim().to_string(),
        namespace: namespace.trim().to_string(),
        name: name.trim().to_string(),
        rule: rule.trim().to_string(),
    }
}

/// Best available "last seen" time of an event.
fn last_seen(event: &Event) -> Option<DateTime<Utc>> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

/// Build a violation from a blocked-admission event and the policy it names.
pub fn convert_event(event: &Event, policy: &KyvernoPolicy, updated: bool) -> Violation {
    let raw = event.message.as_deref().unwrap_or_default();
    let parsed = parse_message(raw);

    let message = policy
        .validation_message(&parsed.rule)
        .unwrap_or(raw)
        .to_string();

    Violation {
        resource: Resource {
            kind: parsed.kind,
            namespace: parsed.namespace,
            name: parsed.name,
        },
        policy: Policy {
            name: policy.name(),
            rule: parsed.rule,
            message,
            category: policy.category().to_string(),
            severity: policy.severity().to_string(),
        },
        event: EventRef {
            name: event.metadata.name.clone().unwrap_or_default(),
            uid: event.metadata.uid.clone().unwrap_or_default(),
        },
        timestamp: last_seen(event).unwrap_or_else(Utc::now),
        updated,
    }
}

/* ============================= WATCHER ============================= */

/// A change observed on the event stream.
#[derive(Debug, Clone)]
pub enum Notification {
    Added(Event),
    Updated(Event),
}

/// What happened to a single notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Published,
    /// Not blocked, or older than the watcher.
    Ignored,
    /// Blocked but unusable (unknown policy, unparsable message).
    Dropped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Published => "published",
            Outcome::Ignored => "ignored",
            Outcome::Dropped => "dropped",
        }
    }
}

pub struct EventWatcher {
    policies: Arc<dyn PolicyStore>,
    publisher: Arc<Publisher>,
    started_at: DateTime<Utc>,
}

impl EventWatcher {
    pub fn new(policies: Arc<dyn PolicyStore>, publisher: Arc<Publisher>) -> Self {
        Self {
            policies,
            publisher,
            started_at: Utc::now(),
        }
    }

    /// Override the replay cutoff. Events older than this are ignored.
    pub fn with_start_time(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Process one notification. Per-event failures are logged and never
    /// returned.
    pub async fn handle(&self, notification: Notification) -> Outcome {
        let outcome = self.process(notification).await;
        metrics::EVENTS.with_label_values(&[outcome.as_str()]).inc();
        outcome
    }

    async fn process(&self, notification: Notification) -> Outcome {
        let (event, updated) = match notification {
            Notification::Added(event) => (event, false),
            Notification::Updated(event) => (event, true),
        };

        if !event.message.as_deref().unwrap_or_default().contains(BLOCKED_MARKER) {
            return Outcome::Ignored;
        }

        // add: creation time; update: last transition
        let observed = if updated {
            last_seen(&event)
        } else {
            event.metadata.creation_timestamp.as_ref().map(|t| t.0)
        };
        match observed {
            Some(at) if at >= self.started_at => {}
            _ => return Outcome::Ignored,
        }

        let policy_name = event.involved_object.name.as_deref().unwrap_or_default();
        let policy_ns = event.involved_object.namespace.as_deref().unwrap_or_default();

        let policy = match self.policies.get_policy(policy_name, policy_ns).await {
            Ok(policy) => policy,
            Err(e) => {
                warn!(policy = %policy_name, namespace = %policy_ns, error = %e, "policy_lookup_failed");
                return Outcome::Dropped;
            }
        };

        let violation = convert_event(&event, &policy, updated);
        if !violation.is_complete() {
            warn!(
                event = %violation.event.name,
                message = ?event.message,
                "unparsable_violation_event"
            );
            return Outcome::Dropped;
        }

        debug!(
            event = %violation.event.name,
            policy = %violation.policy.name,
            rule = %violation.policy.rule,
            updated,
            "violation_published"
        );
        self.publisher.publish(violation).await;
        metrics::VIOLATIONS_PUBLISHED.inc();

        Outcome::Published
    }

    /// Consume a watch stream until `stop` fires.
    ///
    /// Returns `WatchError::SyncFailed` if the stream ends or `stop` fires
    /// before the initial listing arrives.
    pub async fn run_stream<S, E>(&self, stream: S, stop: CancellationToken) -> Result<(), WatchError>
    where
        S: Stream<Item = Result<watcher::Event<Event>, E>>,
        E: Display,
    {
        let mut stream = std::pin::pin!(stream);
        let mut seen = SeenEvents::default();
        let mut synced = false;

        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => {
                    info!(synced, "event_watcher_stopped");
                    return if synced { Ok(()) } else { Err(WatchError::SyncFailed) };
                }
                next = stream.next() => next,
            };

            let Some(item) = next else {
                info!(synced, "event_stream_closed");
                return if synced { Ok(()) } else { Err(WatchError::SyncFailed) };
            };

            match item {
                Ok(watcher::Event::Applied(event)) => {
                    if let Some(notification) = seen.observe(event) {
                        self.handle(notification).await;
                    }
                }
                Ok(watcher::Event::Deleted(event)) => seen.forget(&event),
                Ok(watcher::Event::Restarted(events)) => {
                    for notification in seen.restart(events) {
                        self.handle(notification).await;
                    }
                    if !synced {
                        synced = true;
                        info!(tracked = seen.len(), "event_cache_synced");
                    }
                }
                Err(e) => warn!(error = %e, "event_watch_error"),
            }
        }
    }

    /// Watch admission-denial events in `namespace` ("" for all namespaces).
    pub async fn run(&self, client: Client, namespace: &str, stop: CancellationToken) -> Result<(), WatchError> {
        let api: Api<Event> = if namespace.is_empty() {
            Api::all(client)
        } else {
            Api::namespaced(client, namespace)
        };

        let config = watcher::Config::default().fields(&field_selector());
        info!(namespace = %namespace, started_at = %self.started_at, "event_watcher_starting");

        self.run_stream(watcher(api, config).default_backoff(), stop).await
    }
}

/* ============================= ADD / UPDATE TRACKING ============================= */

/// Last seen resourceVersion per event UID, used to tell new events from
/// updates of known ones.
#[derive(Debug, Default)]
struct SeenEvents {
    versions: HashMap<String, String>,
}

impl SeenEvents {
    fn key(event: &Event) -> Option<(String, String)> {
        let uid = event.metadata.uid.clone()?;
        Some((uid, event.metadata.resource_version.clone().unwrap_or_default()))
    }

    fn observe(&mut self, event: Event) -> Option<Notification> {
        let Some((uid, version)) = Self::key(&event) else {
            return Some(Notification::Added(event));
        };

        match self.versions.insert(uid, version.clone()) {
            None => Some(Notification::Added(event)),
            Some(previous) if previous != version => Some(Notification::Updated(event)),
            Some(_) => None,
        }
    }

    fn forget(&mut self, event: &Event) {
        if let Some(uid) = &event.metadata.uid {
            self.versions.remove(uid);
        }
    }

    fn restart(&mut self, events: Vec<Event>) -> Vec<Notification> {
        let previous = std::mem::take(&mut self.versions);
        let mut notifications = Vec::new();

        for event in events {
            let Some((uid, version)) = Self::key(&event) else {
                notifications.push(Notification::Added(event));
                continue;
            };

            match previous.get(&uid) {
                None => notifications.push(Notification::Added(event)),
                Some(old) if *old != version => notifications.push(Notification::Updated(event)),
                Some(_) => {}
            }
            self.versions.insert(uid, version);
        }

        notifications
    }

    fn len(&self) -> usize {
        self.versions.len()
    }
}

/* ============================= TESTS ============================= */
