// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Unique identifier generation for sessions, messages, parts, tool
//! calls and requests.
//!
//! Stateful generators produce `<prefix>_<counter>_<hex16>`; the counter
//! gives humans a stable within-process ordering when reading logs, the
//! hex suffix carries 64 random bits. The counter is **not** an ordering
//! guarantee across processes.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// 16 lowercase hex chars with 64 bits of entropy.
///
/// A v4 UUID carries 122 random bits but its hex encoding embeds fixed
/// version/variant nibbles, so the two 64-bit halves are XOR-folded
/// instead of truncated.
fn random_suffix() -> String {
    let u = Uuid::new_v4().as_u128();
    format!("{:016x}", (u as u64) ^ ((u >> 64) as u64))
}

/// Stateless id: `<prefix>_<hex16>`.
pub fn generate(prefix: &str) -> String {
    format!("{prefix}_{}", random_suffix())
}

/// A stateful generator for one entity type.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: &'static str,
    counter: AtomicU64,
}

impl IdGenerator {
    pub const fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    /// Next id: `<prefix>_<counter>_<hex16>`.
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}_{}", self.prefix, n, random_suffix())
    }

    /// Current counter value (for diagnostics).
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// The set of generators the runtime hands around as one injected value.
///
/// One instance per process; components receive it as an `Arc` rather
/// than reaching for globals.
#[derive(Debug)]
pub struct IdService {
    session: IdGenerator,
    message: IdGenerator,
    part: IdGenerator,
    tool_call: IdGenerator,
    request: IdGenerator,
}

impl IdService {
    pub const fn new() -> Self {
        Self {
            session: IdGenerator::new("session"),
            message: IdGenerator::new("message"),
            part: IdGenerator::new("part"),
            tool_call: IdGenerator::new("tool"),
            request: IdGenerator::new("req"),
        }
    }

    pub fn session_id(&self) -> String {
        self.session.next()
    }

    pub fn message_id(&self) -> String {
        self.message.next()
    }

    pub fn part_id(&self) -> String {
        self.part.next()
    }

    pub fn tool_call_id(&self) -> String {
        self.tool_call.next()
    }

    pub fn request_id(&self) -> String {
        self.request.next()
    }
}

impl Default for IdService {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
