//! Async readiness collaborator.
//!
//! Heavy per-object compiles (shaders, textures) run outside the
//! scheduler. The cooker only asks two things: start caching an object
//! for a profile, and poll whether it is ready. Both calls are
//! contractually idempotent.

use std::collections::HashMap;

use crate::item::record::CookObject;
use crate::profile::TargetProfile;

/// The async readiness collaborator.
pub trait ReadinessProvider: Send {
    /// Start caching platform data for an object. Idempotent.
    fn begin_cache(&mut self, object: &CookObject, profile: &TargetProfile);

    /// Whether the object's platform data is ready. Idempotent; safe to
    /// call before `begin_cache` (returns false).
    fn is_ready(&mut self, object: &CookObject, profile: &TargetProfile) -> bool;
}

/// Readiness provider that completes everything instantly.
#[derive(Debug, Default)]
pub struct ImmediateReadiness;

impl ImmediateReadiness {
    /// New provider.
    pub fn new() -> Self {
        Self
    }
}

impl ReadinessProvider for ImmediateReadiness {
    fn begin_cache(&mut self, _object: &CookObject, _profile: &TargetProfile) {}

    fn is_ready(&mut self, _object: &CookObject, _profile: &TargetProfile) -> bool {
        true
    }
}

/// Readiness provider that simulates compile latency: an object becomes
/// ready after a fixed number of polls following `begin_cache`.
#[derive(Debug)]
pub struct StaggeredReadiness {
    polls_until_ready: u32,
    polls: HashMap<(String, String), u32>,
}

impl StaggeredReadiness {
    /// Objects become ready after `polls_until_ready` polls.
    pub fn new(polls_until_ready: u32) -> Self {
        Self { polls_until_ready, polls: HashMap::new() }
    }

    fn key(object: &CookObject, profile: &TargetProfile) -> (String, String) {
        (object.name.clone(), profile.name.clone())
    }
}

impl ReadinessProvider for StaggeredReadiness {
    fn begin_cache(&mut self, object: &CookObject, profile: &TargetProfile) {
        self.polls.entry(Self::key(object, profile)).or_insert(0);
    }

    fn is_ready(&mut self, object: &CookObject, profile: &TargetProfile) -> bool {
        match self.polls.get_mut(&Self::key(object, profile)) {
            Some(count) => {
                if *count >= self.polls_until_ready {
                    true
                } else {
                    *count += 1;
                    false
                }
            }
            None => false,
        }
    }
}
