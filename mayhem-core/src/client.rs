//! Backend driven by a backend-specific client.
//!
//! [`ClientBackend`] holds the generic part of every backend: the pagination
//! loop, self and terminal-state exclusion, grouping, health aggregation and
//! the API probe. The [`BackendClient`] supplies the three raw calls.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{aggregate_health, aggregation_key_for, collect_pages, designated_survivors, Backend, Page};
use crate::capability::CapabilityTable;
use crate::error::ChaosError;
use crate::identity::IdentityFields;
use crate::registry::ResourceRegistry;
use crate::resource::{Recovery, Resource, ResourceRef};
use crate::script::{CommandRunner, ScriptOperation, ScriptedResource};
use crate::types::{
    AggregationKey, ApiStatus, BackendHealth, BackendLevel, BackendType, OperationName,
    ResourceHealth,
};

/// One resource as listed by a backend client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResource {
    pub id: String,
    pub kind: String,
    pub status: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

pub trait BackendClient: Send + Sync {
    /// One page of resources matching `filter` (attribute -> required value).
    fn list_page(
        &self,
        filter: &BTreeMap<String, String>,
        token: Option<&str>,
    ) -> Result<Page<RemoteResource>, ChaosError>;

    /// Current status string, or `None` if the resource no longer exists.
    fn resource_status(&self, id: &str) -> Result<Option<String>, ChaosError>;

    fn invoke(&self, id: &str, operation: &OperationName) -> Result<(), ChaosError>;

    /// Cheap call proving the control API answers.
    fn probe(&self) -> Result<(), ChaosError>;
}

/// Everything a [`ClientBackend`] needs besides its client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub backend_type: BackendType,
    pub level: BackendLevel,
    pub destruction_probability: f64,
    pub grouping_identifiers: Vec<String>,
    pub designated_survivor: bool,
    pub filter: BTreeMap<String, String>,
    /// Ids of the resources the engine itself runs on; never experimented on.
    pub self_identifiers: BTreeSet<String>,
    pub terminal_states: BTreeSet<String>,
    pub unhealthy_states: BTreeSet<String>,
    /// Empty means "anything not unhealthy or terminal is healthy".
    pub healthy_states: BTreeSet<String>,
    /// Per resource kind.
    pub capabilities: BTreeMap<String, CapabilityTable>,
    pub scripts: Vec<ScriptOperation>,
    pub cattle: bool,
    /// Default `(minimum, maximum)` durations, for scripts that set only one.
    pub default_durations: (Duration, Duration),
}

impl ClientSettings {
    pub fn new(backend_type: impl Into<BackendType>) -> Self {
        Self {
            backend_type: backend_type.into(),
            level: BackendLevel::Iaas,
            destruction_probability: 0.0,
            grouping_identifiers: Vec::new(),
            designated_survivor: false,
            filter: BTreeMap::new(),
            self_identifiers: BTreeSet::new(),
            terminal_states: BTreeSet::new(),
            unhealthy_states: BTreeSet::new(),
            healthy_states: BTreeSet::new(),
            capabilities: BTreeMap::new(),
            scripts: Vec::new(),
            cattle: false,
            default_durations: (Duration::from_secs(30), Duration::from_secs(300)),
        }
    }

    /// Map a client status string to resource health.
    pub fn health_for(&self, status: Option<&str>) -> ResourceHealth {
        match status {
            None => ResourceHealth::DoesNotExist,
            Some(s) if self.terminal_states.contains(s) => ResourceHealth::DoesNotExist,
            Some(s) if self.unhealthy_states.contains(s) => ResourceHealth::Failed,
            Some(s) if self.healthy_states.is_empty() || self.healthy_states.contains(s) => {
                ResourceHealth::Normal
            }
            Some(_) => ResourceHealth::RunningExperiment,
        }
    }

    fn is_unhealthy(&self, status: &str) -> bool {
        self.unhealthy_states.contains(status)
    }
}

pub struct ClientBackend<C: BackendClient + 'static> {
    settings: Arc<ClientSettings>,
    client: Arc<C>,
    runner: Arc<dyn CommandRunner>,
    last_statuses: Mutex<Vec<String>>,
}

impl<C: BackendClient + 'static> ClientBackend<C> {
    pub fn new(settings: ClientSettings, client: Arc<C>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            settings: Arc::new(settings),
            client,
            runner,
            last_statuses: Mutex::new(Vec::new()),
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn wrap(&self, remote: RemoteResource) -> Box<dyn Resource> {
        let capabilities = self
            .settings
            .capabilities
            .get(&remote.kind)
            .cloned()
            .unwrap_or_default();
        let aggregation_key = aggregation_key_for(&remote.attributes, &self.settings.grouping_identifiers);
        let client: Arc<dyn BackendClient> = self.client.clone();
        let resource = ClientResource {
            id: remote.id,
            kind: remote.kind,
            attributes: remote.attributes,
            aggregation_key,
            capabilities,
            client,
            settings: self.settings.clone(),
        };
        if self.settings.scripts.is_empty() {
            Box::new(resource)
        } else {
            Box::new(ScriptedResource::new(
                Box::new(resource),
                &self.settings.scripts,
                self.settings.cattle,
                self.runner.clone(),
                self.settings.default_durations,
            ))
        }
    }
}

impl<C: BackendClient + 'static> Backend for ClientBackend<C> {
    fn backend_type(&self) -> &BackendType {
        &self.settings.backend_type
    }

    fn level(&self) -> BackendLevel {
        self.settings.level
    }

    fn destruction_probability(&self) -> f64 {
        self.settings.destruction_probability
    }

    fn grouping_identifiers(&self) -> &[String] {
        &self.settings.grouping_identifiers
    }

    fn discover(&self, registry: &ResourceRegistry) -> Result<Vec<ResourceRef>, ChaosError> {
        let listed = collect_pages(|token| self.client.list_page(&self.settings.filter, token))?;

        let total = listed.len();
        let live: Vec<RemoteResource> = listed
            .into_iter()
            .filter(|r| !self.settings.self_identifiers.contains(&r.id))
            .filter(|r| !self.settings.terminal_states.contains(&r.status))
            .collect();

        let statuses: Vec<String> = live.iter().map(|r| r.status.clone()).collect();
        *self.last_statuses.lock().unwrap_or_else(PoisonError::into_inner) = statuses;

        let roster: Vec<ResourceRef> = live
            .into_iter()
            .map(|r| registry.register(&self.settings.backend_type, self.wrap(r)))
            .collect();

        if roster.is_empty() {
            tracing::warn!(
                backend = %self.settings.backend_type,
                listed = total,
                "no matching resources found",
            );
        }

        tracing::debug!(
            backend = %self.settings.backend_type,
            listed = total,
            roster = roster.len(),
            "discovery complete",
        );
        Ok(roster)
    }

    fn experiment_candidates(&self, roster: &[ResourceRef]) -> Vec<ResourceRef> {
        let eligible: Vec<ResourceRef> = roster
            .iter()
            .filter(|r| !r.capabilities().is_empty())
            .cloned()
            .collect();
        if self.settings.designated_survivor {
            designated_survivors(&eligible, &mut rand::thread_rng())
        } else {
            eligible
        }
    }

    fn health(&self) -> BackendHealth {
        let statuses = self.last_statuses.lock().unwrap_or_else(PoisonError::into_inner);
        aggregate_health(statuses.iter().map(String::as_str), |s| self.settings.is_unhealthy(s))
    }

    fn api_status(&self) -> ApiStatus {
        match self.client.probe() {
            Ok(()) => ApiStatus::Ok,
            Err(err) => {
                tracing::warn!(backend = %self.settings.backend_type, error = %err, "API probe failed");
                ApiStatus::Error
            }
        }
    }
}

/// A resource reached through a [`BackendClient`].
pub struct ClientResource {
    id: String,
    kind: String,
    attributes: BTreeMap<String, String>,
    aggregation_key: AggregationKey,
    capabilities: CapabilityTable,
    client: Arc<dyn BackendClient>,
    settings: Arc<ClientSettings>,
}

impl ClientResource {
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

impl fmt::Debug for ClientResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientResource")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("aggregation_key", &self.aggregation_key)
            .finish()
    }
}

impl Resource for ClientResource {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn unique_key(&self) -> &str {
        &self.id
    }

    fn identity_fields(&self) -> IdentityFields {
        IdentityFields::new()
            .with("backend", self.settings.backend_type.0.clone())
            .with("id", self.id.clone())
    }

    fn aggregation_key(&self) -> AggregationKey {
        self.aggregation_key.clone()
    }

    fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    fn check_health(&self) -> Result<ResourceHealth, ChaosError> {
        let status = self.client.resource_status(&self.id)?;
        Ok(self.settings.health_for(status.as_deref()))
    }

    fn invoke(&self, operation: &OperationName) -> Result<Recovery, ChaosError> {
        tracing::info!(
            backend = %self.settings.backend_type,
            resource = %self.id,
            operation = %operation,
            "invoking fault operation",
        );
        self.client.invoke(&self.id, operation)?;

        let corrective = self
            .capabilities
            .get(operation)
            .and_then(|c| c.self_healing.clone());
        let Some(corrective) = corrective else {
            return Ok(Recovery::none());
        };
        let (client, id) = (self.client.clone(), self.id.clone());
        Ok(Recovery::none().with_self_healing(move || client.invoke(&id, &corrective)))
    }

    fn display_name(&self) -> String {
        format!("{}/{}", self.kind, self.id)
    }
}
