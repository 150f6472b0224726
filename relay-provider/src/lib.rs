#![deny(missing_docs)]
//! Provider registry for the relay broker (§4.3).
//!
//! The core treats providers as opaque capabilities referenced by name — it never
//! interprets what "anthropic" or "ollama" means, only that `invoke` exists and that a
//! canonical name is available for telemetry and per-provider semaphore bucketing.
//! This is a narrower contract than the teacher's own `Provider` trait (which is
//! message/completion-shaped); see DESIGN.md for why it isn't reused as-is.

use std::collections::HashMap;
use std::sync::Arc;

use relay_types::CallContext;

/// Opaque capability exposed by a provider back-end.
#[async_trait::async_trait]
pub trait ProviderHandle: Send + Sync {
    /// The canonical provider identifier, used for telemetry and semaphore bucketing.
    fn canonical_name(&self) -> &str;

    /// Invoke a named tool against this provider with the given arguments.
    async fn invoke(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, String>;
}

/// Name-keyed registry of [`ProviderHandle`]s, populated once at bootstrap.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderHandle>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { providers: HashMap::new() }
    }

    /// Register a provider under `name`. Overwrites any prior registration under the
    /// same name — unlike the tool registry, there's no spec requirement that
    /// provider re-registration be rejected.
    pub fn register(&mut self, name: impl Into<String>, handle: Arc<dyn ProviderHandle>) {
        self.providers.insert(name.into(), handle);
    }

    /// Look up a provider by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderHandle>> {
        self.providers.get(name).cloned()
    }

    /// All registered provider names, for telemetry bucket enumeration (§4.3).
    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
