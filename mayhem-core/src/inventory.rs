//! Static inventory client.
//!
//! Serves resources from a YAML file instead of a cloud API:
//!
//! ```yaml
//! resources:
//!   - id: db-1
//!     kind: db-instance
//!     status: available
//!     attributes:
//!       zone: az-1
//! ```
//!
//! Invocations are recorded, not executed. Used for dry runs and tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::backend::Page;
use crate::client::{BackendClient, RemoteResource};
use crate::error::{io_err, ChaosError};
use crate::types::OperationName;

const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Default, Serialize, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    resources: Vec<RemoteResource>,
}

#[derive(Debug)]
pub struct InventoryClient {
    resources: RwLock<Vec<RemoteResource>>,
    page_size: usize,
    invocations: Mutex<Vec<(String, OperationName)>>,
    reachable: AtomicBool,
}

impl InventoryClient {
    pub fn from_resources(resources: Vec<RemoteResource>) -> Self {
        Self {
            resources: RwLock::new(resources),
            page_size: DEFAULT_PAGE_SIZE,
            invocations: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn load_at(path: &Path) -> Result<Self, ChaosError> {
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let file: InventoryFile = serde_yaml::from_str(&contents).map_err(|source| ChaosError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), resources = file.resources.len(), "loaded inventory");
        Ok(Self::from_resources(file.resources))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn set_status(&self, id: &str, status: &str) -> bool {
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        match resources.iter_mut().find(|r| r.id == id) {
            Some(r) => {
                r.status = status.to_string();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| r.id != id);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Every `(resource id, operation)` invoked so far, in order.
    pub fn invocations(&self) -> Vec<(String, OperationName)> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_reachable(&self) -> Result<(), ChaosError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChaosError::backend("inventory", "inventory unreachable"))
        }
    }
}

fn matches(resource: &RemoteResource, filter: &BTreeMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(name, value)| resource.attributes.get(name) == Some(value))
}

impl BackendClient for InventoryClient {
    fn list_page(
        &self,
        filter: &BTreeMap<String, String>,
        token: Option<&str>,
    ) -> Result<Page<RemoteResource>, ChaosError> {
        self.ensure_reachable()?;
        let offset = match token {
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| ChaosError::backend("inventory", format!("bad page token '{t}'")))?,
            None => 0,
        };
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        let matching: Vec<&RemoteResource> = resources.iter().filter(|r| matches(r, filter)).collect();
        let end = (offset + self.page_size).min(matching.len());
        let items = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|r| (*r).clone())
            .collect();
        let next_token = (end < matching.len()).then(|| end.to_string());
        Ok(Page { items, next_token })
    }

    fn resource_status(&self, id: &str) -> Result<Option<String>, ChaosError> {
        self.ensure_reachable()?;
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        Ok(resources.iter().find(|r| r.id == id).map(|r| r.status.clone()))
    }

    fn invoke(&self, id: &str, operation: &OperationName) -> Result<(), ChaosError> {
        self.ensure_reachable()?;
        let known = self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.id == id);
        if !known {
            return Err(ChaosError::ResourceNotFound(id.to_string()));
        }
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.to_string(), operation.clone()));
        Ok(())
    }

    fn probe(&self) -> Result<(), ChaosError> {
        self.ensure_reachable()
    }
}
