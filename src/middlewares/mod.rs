//! Per-key middleware registry and the built-in policies.

mod budget_enforcement;
mod budget_reset;
mod key_validation;
mod rate_limit;
mod usage_tracking;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::domain::{ConfigMap, FieldRole, FieldSchema, FieldType, PluginInfo, PluginSchema};
use crate::keys::KeyService;
use crate::pipeline::Middleware;

pub use rate_limit::RateLimitBuckets;

type Factory = Box<dyn Fn(&ConfigMap) -> Arc<dyn Middleware> + Send + Sync>;

struct Entry {
    schema: PluginSchema,
    factory: Factory,
}

/// Registry of middleware factories. Populated during startup; reads after
/// that never contend.
#[derive(Default)]
pub struct MiddlewareRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, id: impl Into<String>, schema: PluginSchema, factory: F)
    where
        F: Fn(&ConfigMap) -> Arc<dyn Middleware> + Send + Sync + 'static,
    {
        let mut entries = self.entries.write().expect("middleware registry poisoned");
        entries.insert(
            id.into(),
            Entry {
                schema,
                factory: Box::new(factory),
            },
        );
    }

    pub fn instantiate(&self, id: &str, config: &ConfigMap) -> Option<Arc<dyn Middleware>> {
        let entries = self.entries.read().expect("middleware registry poisoned");
        entries.get(id).map(|entry| (entry.factory)(config))
    }

    pub fn infos(&self) -> Vec<PluginInfo> {
        let entries = self.entries.read().expect("middleware registry poisoned");
        entries
            .iter()
            .map(|(id, entry)| PluginInfo {
                id: id.clone(),
                schema: entry.schema.clone(),
            })
            .collect()
    }
}

/// Registers the built-in middleware set. Called once at startup, after the
/// key service exists (two of the policies act through it).
pub fn register_builtins(registry: &MiddlewareRegistry, keys: Arc<KeyService>) {
    let buckets = Arc::new(RateLimitBuckets::new());
    registry.register("rate_limit", rate_limit::schema(), move |config| {
        Arc::new(rate_limit::RateLimit::from_config(
            Arc::clone(&buckets),
            config,
        )) as Arc<dyn Middleware>
    });

    registry.register("key_validation", PluginSchema::new(), |_config| {
        Arc::new(key_validation::KeyValidation) as Arc<dyn Middleware>
    });

    let tracking_keys = Arc::clone(&keys);
    registry.register("usage_tracking", PluginSchema::new(), move |_config| {
        Arc::new(usage_tracking::UsageTracking::new(Arc::clone(
            &tracking_keys,
        ))) as Arc<dyn Middleware>
    });

    registry.register("budget_enforcement", budget_enforcement::schema(), |config| {
        Arc::new(budget_enforcement::BudgetEnforcement::from_config(config))
            as Arc<dyn Middleware>
    });

    let reset_keys = keys;
    registry.register("budget_reset", budget_reset::schema(), move |config| {
        Arc::new(budget_reset::BudgetReset::from_config(
            Arc::clone(&reset_keys),
            config,
        )) as Arc<dyn Middleware>
    });
}

fn limit_field(description: &str) -> FieldSchema {
    FieldSchema::new(FieldType::Number)
        .display_name("Limit")
        .description(description)
        .role(FieldRole::Limit)
}

fn period_field(description: &str) -> FieldSchema {
    FieldSchema::new(FieldType::Number)
        .display_name("Period")
        .description(description)
        .role(FieldRole::Period)
}
