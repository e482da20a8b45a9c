// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Normalized token usage and cost derivation.
//!
//! Whether cached tokens are included in the provider's `input` count
//! is a declared adapter capability ([`ProviderCaps::excludes_cached_input`]),
//! not something inferred from the adapter's name.

use crate::provider::ProviderCaps;
use crate::registry::ModelDescriptor;
use crate::types::RawUsage;

/// Normalized per-step token counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub cost: f64,
    pub tokens: TokenCounts,
}

/// Coerce provider junk (NaN, infinities, negatives) to zero.
fn safe(value: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        0.0
    }
}

pub fn calculate_usage(model: &ModelDescriptor, usage: &RawUsage, caps: &ProviderCaps) -> Usage {
    let input = safe(usage.input);
    let output = safe(usage.output);
    let reasoning = safe(usage.reasoning.unwrap_or(0.0));
    let cache_read = safe(usage.cached_input.unwrap_or(0.0));
    let cache_write = safe(usage.cache_write.unwrap_or(0.0));

    // Cache-excluded families report uncached input directly; everyone
    // else folds cached tokens into `input`, so subtract them back out.
    let adjusted_input = if caps.excludes_cached_input {
        input
    } else {
        safe(input - cache_read - cache_write)
    };

    let total = if caps.excludes_cached_input {
        adjusted_input + output + reasoning + cache_read + cache_write
    } else {
        match usage.total {
            Some(total) => safe(total),
            None => adjusted_input + output + reasoning + cache_read + cache_write,
        }
    };

    let mut cost_table = &model.cost;
    if adjusted_input + cache_read > 200_000.0 {
        if let Some(tier) = &model.cost.experimental_over_200k {
            cost_table = tier;
        }
    }

    let cost = safe(
        adjusted_input * cost_table.input / 1_000_000.0
            + output * cost_table.output / 1_000_000.0
            + cache_read * cost_table.cache_read / 1_000_000.0
            + cache_write * cost_table.cache_write / 1_000_000.0
            + reasoning * cost_table.output / 1_000_000.0,
    );

    Usage {
        cost,
        tokens: TokenCounts {
            input: adjusted_input as u64,
            output: output as u64,
            reasoning: reasoning as u64,
            cache_read: cache_read as u64,
            cache_write: cache_write as u64,
            total: total as u64,
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
