use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

/* ============================= MODEL ============================= */

/// Identity of the object whose admission was blocked.
///
/// An empty `namespace` marks a cluster-scoped resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resource {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// The policy rule that fired, with its display metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    pub name: String,
    pub rule: String,
    pub message: String,
    pub category: String,
    pub severity: String,
}

/// The cluster Event a violation was read from. `name` is the stable join
/// key across re-deliveries of the same occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRef {
    pub name: String,
    pub uid: String,
}

/// One blocked admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub resource: Resource,
    pub policy: Policy,
    pub event: EventRef,
    pub timestamp: DateTime<Utc>,
    /// Set when this supersedes an earlier violation for the same event.
    pub updated: bool,
}

impl Violation {
    pub fn is_cluster_scoped(&self) -> bool {
        self.resource.namespace.is_empty()
    }

    /// Kind, policy and rule must be known before a violation is published.
    pub fn is_complete(&self) -> bool {
        !self.resource.kind.is_empty() && !self.policy.name.is_empty() && !self.policy.rule.is_empty()
    }
}

/* ============================= PUBLISHER ============================= */

pub type ListenerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Listener = Box<dyn Fn(Violation) -> ListenerFuture + Send + Sync>;

/// In-process fan-out of violations to every registered listener.
///
/// Listeners are registered while the publisher is still exclusively owned
/// (`&mut self`); once shared behind an `Arc` the list is frozen. `publish`
/// awaits each listener in registration order on the caller's task, so a
/// slow listener holds up delivery of the current violation.
#[derive(Default)]
pub struct Publisher {
    listeners: Vec<Listener>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_listener<F, Fut>(&mut self, listener: F)
    where
        F: Fn(Violation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listeners.push(Box::new(move |v| Box::pin(listener(v))));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver `violation` to all listeners. Dropped silently when nobody
    /// is listening.
    pub async fn publish(&self, violation: Violation) {
        for listener in &self.listeners {
            listener(violation.clone()).await;
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn violation(event: &str) -> Violation {
        Violation {
            resource: Resource {
                kind: "Pod".to_string(),
                namespace: "test".to_string(),
                name: "nginx".to_string(),
            },
            policy: Policy {
                name: "require-requests".to_string(),
                rule: "check-requests".to_string(),
                ..Default::default()
            },
            event: EventRef {
                name: event.to_string(),
                uid: format!("{event}-uid"),
            },
            timestamp: Utc::now(),
            updated: false,
        }
    }

    #[tokio::test]
    async fn test_publish_without_listeners_is_noop() {
        let publisher = Publisher::new();
        publisher.publish(violation("e1")).await;
        assert_eq!(publisher.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_listeners_called_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut publisher = Publisher::new();

        for id in ["first", "second", "third"] {
            let calls = calls.clone();
            publisher.register_listener(move |v: Violation| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(format!("{id}:{}", v.event.name));
                }
            });
        }

        publisher.publish(violation("e1")).await;

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["first:e1", "second:e1", "third:e1"]
        );
    }

    #[tokio::test]
    async fn test_identical_listeners_are_not_deduplicated() {
        let count = Arc::new(Mutex::new(0));
        let mut publisher = Publisher::new();

        for _ in 0..2 {
            let count = count.clone();
            publisher.register_listener(move |_| {
                let count = count.clone();
                async move {
                    *count.lock().unwrap() += 1;
                }
            });
        }

        publisher.publish(violation("e1")).await;
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_cluster_scope_from_empty_namespace() {
        let mut v = violation("e1");
        assert!(!v.is_cluster_scoped());
        v.resource.namespace.clear();
        assert!(v.is_cluster_scoped());
    }

    #[test]
    fn test_completeness_requires_kind_policy_and_rule() {
        let v = violation("e1");
        assert!(v.is_complete());

        let mut missing_rule = v.clone();
        missing_rule.policy.rule.clear();
        assert!(!missing_rule.is_complete());

        let mut missing_kind = v;
        missing_kind.resource.kind.clear();
        assert!(!missing_kind.is_complete());
    }
}
