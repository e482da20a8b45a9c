// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::Provider;

/// Per-million-token prices in USD. Reasoning tokens are priced at the
/// output rate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    /// Price tier applied once `input + cache.read` crosses 200k tokens.
    pub experimental_over_200k: Option<Box<ModelCost>>,
}

impl ModelCost {
    pub fn new(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Self {
        Self {
            input,
            output,
            cache_read,
            cache_write,
            experimental_over_200k: None,
        }
    }

    pub fn with_over_200k(mut self, tier: ModelCost) -> Self {
        self.experimental_over_200k = Some(Box::new(tier));
        self
    }
}

/// Everything the accounting layer needs to know about one model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelDescriptor {
    pub provider_id: String,
    pub model_id: String,
    pub cost: ModelCost,
    pub context_window: Option<u32>,
}

/// Registry of provider adapters keyed by `(provider_id, model_id)`,
/// injected into the loop at process start.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<(String, String), Arc<dyn Provider>>,
    descriptors: HashMap<(String, String), ModelDescriptor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>, descriptor: ModelDescriptor) {
        let key = (
            descriptor.provider_id.clone(),
            descriptor.model_id.clone(),
        );
        self.providers.insert(key.clone(), provider);
        self.descriptors.insert(key, descriptor);
    }

    pub fn resolve(&self, provider_id: &str, model_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .get(&(provider_id.to_string(), model_id.to_string()))
            .cloned()
    }

    pub fn descriptor(&self, provider_id: &str, model_id: &str) -> Option<ModelDescriptor> {
        self.descriptors
            .get(&(provider_id.to_string(), model_id.to_string()))
            .cloned()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::mock::ScriptedProvider;

    use super::*;

    #[test]
    fn resolve_returns_registered_provider() {
        let mut reg = ProviderRegistry::new();
        let provider = Arc::new(ScriptedProvider::always_text("hi"));
        reg.register(
            provider,
            ModelDescriptor {
                provider_id: "scripted".into(),
                model_id: "scripted-model".into(),
                ..Default::default()
            },
        );
        assert!(reg.resolve("scripted", "scripted-model").is_some());
        assert!(reg.resolve("scripted", "other").is_none());
    }

    #[test]
    fn descriptor_carries_cost_table() {
        let mut reg = ProviderRegistry::new();
        reg.register(
            Arc::new(ScriptedProvider::always_text("hi")),
            ModelDescriptor {
                provider_id: "p".into(),
                model_id: "m".into(),
                cost: ModelCost::new(3.0, 15.0, 0.3, 3.75),
                context_window: Some(200_000),
            },
        );
        let d = reg.descriptor("p", "m").unwrap();
        assert_eq!(d.cost.output, 15.0);
        assert_eq!(d.context_window, Some(200_000));
    }
}
