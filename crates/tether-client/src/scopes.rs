use std::collections::HashMap;

use tether_core::context::ClientContext;

/// Partial contexts contributed by independent UI scopes, merged into the
/// single context sent to the server. Lets each component own its facet
/// without a central store.
///
/// Merge rule: iterate scopes in insertion order; simple fields and
/// metadata keys are shallow-overwritten (last writer wins), while
/// `capabilities` are concatenated and deduplicated preserving the first
/// occurrence.
#[derive(Default)]
pub struct ScopedContext {
    order: Vec<String>,
    scopes: HashMap<String, ClientContext>,
}

impl ScopedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the partial context for a scope. An existing scope keeps its
    /// position in the merge order.
    pub fn set(&mut self, scope: impl Into<String>, partial: ClientContext) {
        let scope = scope.into();
        if self.scopes.insert(scope.clone(), partial).is_none() {
            self.order.push(scope);
        }
    }

    pub fn remove(&mut self, scope: &str) -> bool {
        if self.scopes.remove(scope).is_some() {
            self.order.retain(|s| s != scope);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.scopes.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Merge all scopes into one context.
    pub fn merged(&self) -> ClientContext {
        let mut merged = ClientContext::default();
        for scope in &self.order {
            let Some(partial) = self.scopes.get(scope) else {
                continue;
            };
            if partial.page_id.is_some() {
                merged.page_id.clone_from(&partial.page_id);
            }
            if partial.active_tab.is_some() {
                merged.active_tab.clone_from(&partial.active_tab);
            }
            for capability in &partial.capabilities {
                if !merged.capabilities.contains(capability) {
                    merged.capabilities.push(capability.clone());
                }
            }
            for (key, value) in &partial.metadata {
                merged.metadata.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}
