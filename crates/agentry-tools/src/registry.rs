//! Name+tag-indexed registry with capability resolution
//!
//! A capability token is either a bare name (one handler) or `@tag` (every
//! handler carrying that tag, in tag-bucket insertion order). Resolution is
//! a pure function of (capabilities, registry state): order-preserving,
//! deduplicating by first-seen name.

use crate::tool::Tool;
use agentry_llm::ToolDef;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub struct Registry<H> {
    handlers: HashMap<String, H>,
    /// tag -> handler names, in registration order
    tags: HashMap<String, Vec<String>>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            tags: HashMap::new(),
        }
    }
}

impl<H: Clone> Registry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Replaces any existing handler with the same name.
    pub fn register(&mut self, name: impl Into<String>, handler: H) {
        self.register_tagged(name, &[], handler);
    }

    pub fn register_tagged(&mut self, name: impl Into<String>, tags: &[&str], handler: H) {
        let name = name.into();
        for tag in tags {
            let bucket = self.tags.entry((*tag).to_string()).or_default();
            if !bucket.iter().any(|n| n == &name) {
                bucket.push(name.clone());
            }
        }
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<H> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Resolve capability tokens into an ordered, deduplicated handler list.
    ///
    /// `missing_label` controls what happens when a bare name has no handler:
    /// `Some(kind)` logs a warning, `None` stays silent (the same token may
    /// resolve in the other registry).
    pub fn select_by_capabilities(
        &self,
        capabilities: &[String],
        missing_label: Option<&str>,
    ) -> Vec<(String, H)> {
        let mut selected: Vec<(String, H)> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        let mut push = |name: &str, handler: H, selected: &mut Vec<(String, H)>| {
            if !seen.iter().any(|s| s == name) {
                seen.push(name.to_string());
                selected.push((name.to_string(), handler));
            }
        };

        for capability in capabilities {
            if let Some(tag) = capability.strip_prefix('@') {
                for name in self.tags.get(tag).into_iter().flatten() {
                    if let Some(handler) = self.handlers.get(name) {
                        push(name, handler.clone(), &mut selected);
                    }
                }
            } else if let Some(handler) = self.handlers.get(capability.as_str()) {
                push(capability, handler.clone(), &mut selected);
            } else if let Some(kind) = missing_label {
                warn!(capability = %capability, "unknown {kind} capability");
            }
        }
        selected
    }
}

/// Tool registry: handlers are shared trait objects.
pub type ToolRegistry = Registry<Arc<dyn Tool>>;

/// Model-facing definitions for a resolved tool list.
pub fn tool_definitions(tools: &[(String, Arc<dyn Tool>)]) -> Vec<ToolDef> {
    tools.iter().map(|(_, tool)| tool.definition()).collect()
}
