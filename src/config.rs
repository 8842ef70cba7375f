use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StoreError};
use crate::leader::ElectionConfig;
use crate::report::ReportSettings;
use crate::retry;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
const DEFAULT_NAMESPACE: &str = "default";

/* ============================= SCHEMA ============================= */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Namespace of this deployment; used for the lease and the basic auth
    /// secret.
    pub namespace: String,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub leader_election: LeaderElectionConfig,
    pub block_reports: BlockReportsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Console,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub port: u16,
    pub basic_auth: BasicAuth,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            basic_auth: BasicAuth::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
    /// Secret holding `username` and `password` keys.
    pub secret_ref: String,
}

impl BasicAuth {
    pub fn is_enabled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Load credentials from `secret_ref` in `namespace`. Keys missing from
    /// the secret leave the configured value untouched.
    pub async fn resolve_secret(&mut self, client: Client, namespace: &str) -> Result<(), StoreError> {
        if self.secret_ref.is_empty() {
            return Ok(());
        }

        let api: Api<Secret> = Api::namespaced(client, namespace);
        let (api, name) = (&api, self.secret_ref.as_str());
        let secret = retry::kube(move || async move { Ok(api.get(name).await?) }).await?;
        let data = secret.data.unwrap_or_default();

        let value = |key: &str| {
            data.get(key)
                .and_then(|v| String::from_utf8(v.0.clone()).ok())
                .filter(|v| !v.is_empty())
        };

        if let Some(username) = value("username") {
            self.username = username;
        }
        if let Some(password) = value("password") {
            self.password = password;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lock_name: String,
    pub pod_name: String,
    /// Seconds.
    pub lease_duration: u64,
    pub renew_deadline: u64,
    pub retry_period: u64,
    pub release_on_cancel: bool,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lock_name: "kyverno-plugin".to_string(),
            pod_name: String::new(),
            lease_duration: 15,
            renew_deadline: 10,
            retry_period: 2,
            release_on_cancel: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BlockReportsConfig {
    pub enabled: bool,
    /// Empty watches all namespaces.
    pub event_namespace: String,
    pub source: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub results: ResultsConfig,
}

impl Default for BlockReportsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            event_namespace: String::new(),
            source: "Kyverno Event".to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            results: ResultsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResultsConfig {
    pub max_per_report: usize,
    pub keep_only_latest: bool,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            max_per_report: 200,
            keep_only_latest: false,
        }
    }
}

/* ============================= LOADING ============================= */

impl Config {
    /// Read `path`, or `./config.yaml` when present, then fill unset fields
    /// from the environment. An explicit path that cannot be read is an
    /// error; a missing default file is not.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => Config::from_yaml(&raw)?,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Config, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Complete identity fields from the pod environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if self.namespace.is_empty() {
            self.namespace = non_empty("POD_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        }

        if self.leader_election.pod_name.is_empty() {
            self.leader_election.pod_name = non_empty("POD_NAME")
                .or_else(|| non_empty("HOSTNAME"))
                .unwrap_or_default();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let le = &self.leader_election;

        if self.block_reports.results.max_per_report == 0 {
            return Err(ConfigError::Invalid(
                "blockReports.results.maxPerReport must be at least 1".to_string(),
            ));
        }
        if le.retry_period == 0 {
            return Err(ConfigError::Invalid(
                "leaderElection.retryPeriod must be positive".to_string(),
            ));
        }
        if le.renew_deadline >= le.lease_duration {
            return Err(ConfigError::Invalid(format!(
                "leaderElection.renewDeadline ({}) must be less than leaseDuration ({})",
                le.renew_deadline, le.lease_duration
            )));
        }
        if le.retry_period >= le.renew_deadline {
            return Err(ConfigError::Invalid(format!(
                "leaderElection.retryPeriod ({}) must be less than renewDeadline ({})",
                le.retry_period, le.renew_deadline
            )));
        }
        if le.enabled && le.pod_name.is_empty() {
            return Err(ConfigError::Invalid(
                "leaderElection.podName is required when leader election is enabled".to_string(),
            ));
        }

        Ok(())
    }

    pub fn election_config(&self) -> ElectionConfig {
        let le = &self.leader_election;
        ElectionConfig {
            lease_name: le.lock_name.clone(),
            namespace: self.namespace.clone(),
            identity: le.pod_name.clone(),
            lease_duration: Duration::from_secs(le.lease_duration),
            renew_deadline: Duration::from_secs(le.renew_deadline),
            retry_period: Duration::from_secs(le.retry_period),
            release_on_cancel: le.release_on_cancel,
        }
    }

    pub fn report_settings(&self) -> ReportSettings {
        let br = &self.block_reports;
        ReportSettings::new(
            br.results.max_per_report,
            br.source.clone(),
            br.results.keep_only_latest,
            br.labels.clone(),
            br.annotations.clone(),
        )
    }
}

/* ============================= TESTS ============================= */
