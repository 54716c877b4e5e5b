// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata for known models.
//!
//! The bundled `models.yaml` maps each model to its wire API, endpoint,
//! capabilities, limits and per-million-token pricing.  Read-only after
//! load.

use std::sync::OnceLock;

use serde::Deserialize;

use crate::types::{Model, Usage};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<Model>,
}

/// All entries from the bundled static catalog.
pub fn static_catalog() -> &'static [Model] {
    static CATALOG: OnceLock<Vec<Model>> = OnceLock::new();
    CATALOG.get_or_init(|| {
        let yaml = include_str!("../models.yaml");
        let catalog: CatalogFile =
            serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
        catalog.models
    })
}

/// Look up a model by provider and id.  Returns `None` if unknown.
pub fn get_model(provider: &str, model_id: &str) -> Option<Model> {
    static_catalog()
        .iter()
        .find(|m| m.provider == provider && m.id == model_id)
        .cloned()
}

/// All models for one provider.
pub fn get_models(provider: &str) -> Vec<Model> {
    static_catalog().iter().filter(|m| m.provider == provider).cloned().collect()
}

/// All provider ids present in the catalog, deduplicated, in file order.
pub fn get_providers() -> Vec<String> {
    let mut providers: Vec<String> = Vec::new();
    for model in static_catalog() {
        if !providers.iter().any(|p| p == &model.provider) {
            providers.push(model.provider.clone());
        }
    }
    providers
}

/// Recompute `usage.cost` from the model's per-million pricing.
///
/// Called on every usage update while streaming; the final update holds
/// `cost.total = Σ cost.*` and `total_tokens = input + output + cache_read
/// + cache_write`.
pub fn calculate_cost(model: &Model, usage: &mut Usage) {
    usage.cost.input = model.cost.input / 1_000_000.0 * usage.input as f64;
    usage.cost.output = model.cost.output / 1_000_000.0 * usage.output as f64;
    usage.cost.cache_read = model.cost.cache_read / 1_000_000.0 * usage.cache_read as f64;
    usage.cost.cache_write = model.cost.cache_write / 1_000_000.0 * usage.cache_write as f64;
    usage.cost.total =
        usage.cost.input + usage.cost.output + usage.cost.cache_read + usage.cost.cache_write;
}

/// Whether the model accepts the `xhigh` reasoning effort.  Everything
/// else clamps it down to `high`.
pub fn supports_xhigh(model: &Model) -> bool {
    model.id.contains("gpt-5.2")
}

/// Model identity comparison by `(id, provider)`.
pub fn models_are_equal(a: Option<&Model>, b: Option<&Model>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.id == b.id && a.provider == b.provider,
        _ => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
