//! Backends: one per infrastructure kind.
//!
//! A backend discovers its resources into the registry, reports aggregate and
//! API health, and narrows a roster down to the resources that may be
//! disrupted together. Backends managing redundancy groups apply the
//! designated-survivor rule via [`designated_survivors`].

use std::collections::{BTreeMap, HashSet};

use rand::seq::IteratorRandom;
use rand::Rng;

use crate::error::ChaosError;
use crate::registry::ResourceRegistry;
use crate::resource::ResourceRef;
use crate::types::{AggregationKey, ApiStatus, BackendHealth, BackendLevel, BackendType};

pub trait Backend: Send + Sync {
    fn backend_type(&self) -> &BackendType;

    fn level(&self) -> BackendLevel;

    /// Probability in `[0, 1]` that a candidate is selected on a tick.
    fn destruction_probability(&self) -> f64;

    /// Attribute names consulted, in order, to compute aggregation keys.
    fn grouping_identifiers(&self) -> &[String];

    /// Query the backend and return the live roster, deduplicated through `registry`.
    fn discover(&self, registry: &ResourceRegistry) -> Result<Vec<ResourceRef>, ChaosError>;

    /// Narrow a roster from this tick's [`Backend::discover`] to experiment candidates.
    fn experiment_candidates(&self, roster: &[ResourceRef]) -> Vec<ResourceRef> {
        roster.to_vec()
    }

    fn health(&self) -> BackendHealth;

    /// Cheap control-API probe. Never propagates errors.
    fn api_status(&self) -> ApiStatus;
}

/// Keep every ungrouped resource plus exactly one other group chosen uniformly
/// at random, so a single tick can never disrupt all redundancy groups.
pub fn designated_survivors<R: Rng + ?Sized>(roster: &[ResourceRef], rng: &mut R) -> Vec<ResourceRef> {
    let mut groups: BTreeMap<AggregationKey, Vec<ResourceRef>> = BTreeMap::new();
    for resource in roster {
        groups
            .entry(resource.aggregation_key())
            .or_default()
            .push(resource.clone());
    }

    let mut chosen = groups
        .remove(&AggregationKey::ungrouped())
        .unwrap_or_default();
    if let Some(key) = groups.keys().choose(rng).cloned() {
        tracing::debug!(group = %key, "designated group for this tick");
        if let Some(members) = groups.remove(&key) {
            chosen.extend(members);
        }
    }
    chosen
}

/// First grouping identifier (in configured order) with a non-blank value in
/// `attributes`.
pub fn aggregation_key_for(
    attributes: &BTreeMap<String, String>,
    grouping_identifiers: &[String],
) -> AggregationKey {
    grouping_identifiers
        .iter()
        .find_map(|name| attributes.get(name).filter(|value| !value.trim().is_empty()))
        .map(|value| AggregationKey::from(value.as_str()))
        .unwrap_or_default()
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// Follow continuation tokens until the listing is exhausted.
///
/// A token seen twice ends the loop, so a misbehaving API cannot spin forever.
pub fn collect_pages<T, F>(mut fetch: F) -> Result<Vec<T>, ChaosError>
where
    F: FnMut(Option<&str>) -> Result<Page<T>, ChaosError>,
{
    let mut items = Vec::new();
    let mut token: Option<String> = None;
    let mut seen = HashSet::new();
    let mut page_no = 0usize;
    loop {
        page_no += 1;
        tracing::trace!(page = page_no, "fetching page");
        let page = fetch(token.as_deref())?;
        items.extend(page.items);
        match page.next_token {
            Some(next) if seen.insert(next.clone()) => token = Some(next),
            Some(next) => {
                tracing::warn!(token = %next, "continuation token repeated, stopping pagination");
                break;
            }
            None => break,
        }
    }
    Ok(items)
}

/// Fold per-resource states into an aggregate: `Ok` when nothing is bad,
/// `Failed` when everything is, `Degraded` otherwise.
pub fn aggregate_health<'a>(
    states: impl IntoIterator<Item = &'a str>,
    is_bad: impl Fn(&str) -> bool,
) -> BackendHealth {
    let mut total = 0usize;
    let mut bad = 0usize;
    for state in states {
        total += 1;
        if is_bad(state) {
            bad += 1;
        }
    }
    match bad {
        0 => BackendHealth::Ok,
        n if n == total => BackendHealth::Failed,
        _ => BackendHealth::Degraded,
    }
}
