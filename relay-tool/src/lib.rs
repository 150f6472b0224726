#![deny(missing_docs)]
//! Tool registry for the relay broker.
//!
//! Defines the object-safe [`ToolDyn`] trait and [`ToolRegistry`], the read-only,
//! populated-once-at-startup catalog described in §4.2. Any tool implementation —
//! a local function, an MCP-bridged tool, an HTTP-backed one — implements [`ToolDyn`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use relay_types::{CallContext, ToolDescriptor};

/// Object-safe trait for tool implementations.
///
/// Tools are stored as `Arc<dyn ToolDyn>` in [`ToolRegistry`]. `execute` is the only
/// method the dispatcher calls at request time; `descriptor` is read once at
/// registration and thereafter immutable (§4.2).
pub trait ToolDyn: Send + Sync {
    /// The tool's static, immutable-after-registration descriptor.
    fn descriptor(&self) -> &ToolDescriptor;

    /// Execute the tool with validated input and a call context.
    ///
    /// Implementations MUST observe `ctx.cancellation` at I/O boundaries (§4.7) and
    /// MUST NOT retry internally — retry policy belongs to the caller, never to the
    /// dispatcher or the tool (§4.6).
    fn execute(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send + '_>>;
}

/// Error returned by [`ToolRegistry::register`] when a name collides with a
/// differently-shaped existing registration.
#[derive(Debug, thiserror::Error)]
#[error("tool {0:?} is already registered with a different implementation")]
pub struct DuplicateTool(pub String);

/// Read-only-after-startup catalog of callable tools, keyed by name.
///
/// Unlike a cache or session map, this registry is never mutated once the daemon
/// finishes bootstrap (§4.2): no locking is needed on the read path.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolDyn>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Register a tool under its descriptor's name.
    ///
    /// Idempotent by name: registering the exact same `Arc` pointer twice is a no-op.
    /// Registering a *different* implementation under a name that's already taken is
    /// rejected with [`DuplicateTool`] — this is a deliberate strengthening of the
    /// teacher's own `ToolRegistry::register`, which silently overwrote; §4.2 says
    /// "second registration of same name with different implementation is rejected".
    pub fn register(&mut self, tool: Arc<dyn ToolDyn>) -> Result<(), DuplicateTool> {
        let name = tool.descriptor().name.clone();
        match self.tools.get(&name) {
            Some(existing) if Arc::ptr_eq(existing, &tool) => Ok(()),
            Some(_) => Err(DuplicateTool(name)),
            None => {
                self.tools.insert(name, tool);
                Ok(())
            }
        }
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolDyn>> {
        self.tools.get(name)
    }

    /// List descriptors visible at or below `max_visibility`, sorted by name for
    /// stable client listings (§4.2).
    #[must_use]
    pub fn list(&self, filter: impl Fn(&ToolDescriptor) -> bool) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|t| t.descriptor().clone())
            .filter(|d| filter(d))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
