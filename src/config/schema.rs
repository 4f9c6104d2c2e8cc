//! Configuration schema for `kiln.toml`.
//!
//! The whole configuration is one process-scoped struct, constructed at
//! session start and passed by reference to every component. Nothing in
//! the cooker reads ambient global state.
//!
//! # Example
//!
//! ```toml
//! [project]
//! name = "my-game"
//! src = "content"
//! out = "cooked"
//!
//! [profiles.desktop]
//! settings = { compression = "zstd" }
//!
//! [profiles.handheld]
//! settings = { compression = "lz4", texture_budget = "low" }
//!
//! [scheduler]
//! tick_budget_ms = 100
//! desired_save_queue_length = 16
//!
//! [distribution]
//! workers = 4
//! colocation = "same_worker"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::item::generation::GenerationOrder;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    /// Project identity and paths
    pub project: ProjectConfig,
    /// Target output profiles, keyed by name
    pub profiles: BTreeMap<String, ProfileConfig>,
    /// Scheduler tuning
    pub scheduler: SchedulerConfig,
    /// Generator/generated split behavior
    pub generation: GenerationConfig,
    /// Multi-worker distribution
    pub distribution: DistributionConfig,
    /// Item-name prefixes that are never cooked; a placeholder result is
    /// recorded instead
    pub never_cook: Vec<String>,
}

impl Default for KilnConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("default".to_string(), ProfileConfig::default());
        Self {
            project: ProjectConfig::default(),
            profiles,
            scheduler: SchedulerConfig::default(),
            generation: GenerationConfig::default(),
            distribution: DistributionConfig::default(),
            never_cook: Vec::new(),
        }
    }
}

/// Project identity and directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project name
    pub name: String,
    /// Project version
    pub version: String,
    /// Source content directory, relative to the project root
    pub src: String,
    /// Output directory, relative to the project root
    pub out: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "untitled".to_string(),
            version: "0.1.0".to_string(),
            src: "content".to_string(),
            out: "cooked".to_string(),
        }
    }
}

/// One target output profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Whether the profile participates in builds
    pub enabled: bool,
    /// Output subdirectory override (defaults to the profile name)
    pub out: Option<String>,
    /// Settings that feed the global fingerprint; any change here forces
    /// a full rebuild of the profile
    pub settings: BTreeMap<String, String>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self { enabled: true, out: None, settings: BTreeMap::new() }
    }
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wall-clock budget of one tick, in milliseconds
    pub tick_budget_ms: u64,
    /// Budget of a single action within a tick, in milliseconds
    pub action_slice_ms: u64,
    /// Load queue depth the scheduler tops up to each pass
    pub desired_load_queue_length: usize,
    /// Save queue depth the scheduler drains down to each pass
    pub desired_save_queue_length: usize,
    /// Maximum items pushed through load per pump call
    pub load_batch_size: usize,
    /// Maximum concurrent preloads in flight
    pub max_concurrent_preloads: usize,
    /// Maximum in-flight async-cache calls per object class
    pub max_async_cache_per_class: usize,
    /// Backoff before retrying a queue that reported busy, in
    /// milliseconds
    pub busy_retry_ms: u64,
    /// Emit an escalating diagnostic when a queue stays blocked longer
    /// than this, in seconds
    pub blocked_warning_secs: u64,
    /// Maximum items to batch into one request cluster
    pub cluster_batch_size: usize,
    /// Soft cap on resident object caches before the GC pollable evicts
    pub max_resident_object_caches: usize,
    /// Period of the GC pollable, in milliseconds
    pub gc_period_ms: u64,
    /// Period of the diagnostics pollable, in milliseconds
    pub diagnostics_period_ms: u64,
    /// Idle-due period applied to pollables, in milliseconds
    pub idle_period_ms: u64,
    /// Longest sleep in batch mode when no work is actionable, in
    /// milliseconds
    pub max_sleep_ms: u64,
    /// At the topmost urgency, service Save before Load (policy knob;
    /// both orders are legal)
    pub urgent_save_first: bool,
    /// Cooperative-yield mode: return from the tick instead of sleeping
    /// when blocked (for callers embedding the loop in a frame tick)
    pub realtime: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_budget_ms: 100,
            action_slice_ms: 25,
            desired_load_queue_length: 32,
            desired_save_queue_length: 16,
            load_batch_size: 8,
            max_concurrent_preloads: 8,
            max_async_cache_per_class: 4,
            busy_retry_ms: 50,
            blocked_warning_secs: 30,
            cluster_batch_size: 256,
            max_resident_object_caches: 256,
            gc_period_ms: 2000,
            diagnostics_period_ms: 5000,
            idle_period_ms: 200,
            max_sleep_ms: 500,
            urgent_save_first: true,
            realtime: false,
        }
    }
}

/// Generator/generated split configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Default save ordering between a generator and its generated items
    pub order: GenerationOrder,
    /// Hard cap on prepare-save re-entrancy before erroring out
    pub prepare_depth_limit: u8,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { order: GenerationOrder::Independent, prepare_depth_limit: 8 }
    }
}

/// Generator/generated worker co-location policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColocationPolicy {
    /// No restriction
    AnyWorker,
    /// The whole family must land on one worker
    SameWorker,
    /// Generated items must land with the generator, but the family may
    /// be split from unrelated items
    SomeSameWorker,
    /// Generated items must not land on the generator's worker
    NoneSameWorker,
}

impl Default for ColocationPolicy {
    fn default() -> Self {
        ColocationPolicy::SameWorker
    }
}

/// Multi-worker distribution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Number of workers; 0 disables distribution
    pub workers: usize,
    /// Generator/generated co-location policy
    pub colocation: ColocationPolicy,
    /// Maximum items retracted from a worker per retraction request
    pub retraction_max: usize,
    /// Worker heartbeat period, in seconds
    pub heartbeat_secs: u64,
    /// Warn while waiting on a fence longer than this, in seconds
    pub fence_warning_secs: u64,
    /// Queue-depth imbalance ratio that triggers a retraction
    pub retraction_imbalance: f64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            colocation: ColocationPolicy::SameWorker,
            retraction_max: 16,
            heartbeat_secs: 5,
            fence_warning_secs: 10,
            retraction_imbalance: 4.0,
        }
    }
}

/// Default configuration: one enabled `default` profile, standard
/// scheduler tuning, distribution disabled.
pub fn default_config() -> KilnConfig {
    KilnConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = default_config();
        assert_eq!(config.project.src, "content");
        assert_eq!(config.project.out, "cooked");
        assert_eq!(config.profiles.len(), 1);
        assert!(config.profiles["default"].enabled);
        assert_eq!(config.distribution.workers, 0);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: KilnConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.tick_budget_ms, 100);
        assert_eq!(config.generation.order, GenerationOrder::Independent);
    }

    #[test]
    fn test_parse_full_toml() {
        let text = r#"
            never_cook = ["editor/", "debug/"]

            [project]
            name = "demo"
            src = "assets"
            out = "baked"

            [profiles.desktop]
            settings = { compression = "zstd" }

            [profiles.handheld]
            out = "hh"
            settings = { compression = "lz4" }

            [scheduler]
            desired_save_queue_length = 4
            urgent_save_first = false

            [generation]
            order = "generated_first"

            [distribution]
            workers = 3
            colocation = "none_same_worker"
        "#;
        let config: KilnConfig = toml::from_str(text).unwrap();
        assert_eq!(config.project.name, "demo");
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.profiles["handheld"].out.as_deref(), Some("hh"));
        assert_eq!(config.scheduler.desired_save_queue_length, 4);
        assert!(!config.scheduler.urgent_save_first);
        assert_eq!(config.generation.order, GenerationOrder::GeneratedFirst);
        assert_eq!(config.distribution.workers, 3);
        assert_eq!(config.distribution.colocation, ColocationPolicy::NoneSameWorker);
        assert_eq!(config.never_cook.len(), 2);
    }

    #[test]
    fn test_roundtrip() {
        let config = default_config();
        let text = toml::to_string(&config).unwrap();
        let parsed: KilnConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.project.name, config.project.name);
        assert_eq!(parsed.scheduler.tick_budget_ms, config.scheduler.tick_budget_ms);
    }
}
