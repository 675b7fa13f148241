//! Static service and feature catalogs.
//!
//! A service entry carries the concurrency limit, timeouts, attempt cap, and
//! call surface for one backend. A feature recipe is an ordered list of
//! service names; a job executes its recipe one step at a time.

use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAuth {
    /// Send the internal API key under the named header.
    ApiKeyHeader { header: String },
    /// `Authorization: Bearer {key}`.
    Bearer,
    None,
}

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    /// Maximum concurrent leases.
    pub limit: u32,
    /// Per-step timeout; also the lease wait budget.
    pub timeout: Duration,
    pub lease_ttl: Duration,
    pub max_step_attempts: u32,
    pub base_url: String,
    pub execute_path: String,
    pub health_path: String,
    pub auth: ServiceAuth,
}

impl ServiceSpec {
    pub fn execute_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.execute_path)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.health_path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    services: BTreeMap<String, ServiceSpec>,
}

impl ServiceCatalog {
    pub fn new(specs: impl IntoIterator<Item = ServiceSpec>) -> Self {
        Self {
            services: specs
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureCatalog {
    features: BTreeMap<String, Vec<String>>,
}

impl FeatureCatalog {
    pub fn new<N, S, R>(features: impl IntoIterator<Item = (N, R)>) -> Self
    where
        N: Into<String>,
        S: Into<String>,
        R: IntoIterator<Item = S>,
    {
        Self {
            features: features
                .into_iter()
                .map(|(name, recipe)| {
                    (
                        name.into(),
                        recipe.into_iter().map(Into::into).collect::<Vec<_>>(),
                    )
                })
                .collect(),
        }
    }

    pub fn contains(&self, feature: &str) -> bool {
        self.features.contains_key(feature)
    }

    /// Ordered list of service names for `feature`.
    pub fn recipe(&self, feature: &str) -> Option<&[String]> {
        self.features.get(feature).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }
}
