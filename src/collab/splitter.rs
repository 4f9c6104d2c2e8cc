//! Item splitter capability hooks.
//!
//! A splitter turns one generator item into several generated items.
//! Implementations register against an item predicate; the registry is
//! resolved once per item into an index, not re-matched on every step.
//! The operation set is deliberately closed: list, populate, validate.

use crate::item::generation::GenerationOrder;
use crate::item::record::{CookObject, ItemId};

/// One planned generated item, before it has an identity of its own.
#[derive(Debug, Clone)]
pub struct GeneratedSpec {
    /// Suffix appended under the generator's `_generated_` namespace
    pub suffix: String,
    /// Initial object set of the generated item
    pub objects: Vec<CookObject>,
}

impl GeneratedSpec {
    /// The full item id this spec produces under `generator`.
    pub fn item_id(&self, generator: &ItemId) -> ItemId {
        ItemId::new(format!("{}/_generated_/{}", generator, self.suffix))
    }
}

/// The splitter capability interface.
pub trait ItemSplitter: Send {
    /// Splitter name, for diagnostics.
    fn name(&self) -> &str;

    /// Whether this splitter applies to the given item.
    fn matches(&self, id: &ItemId, objects: &[CookObject]) -> bool;

    /// Save-ordering override for families produced by this splitter.
    fn order_override(&self) -> Option<GenerationOrder> {
        None
    }

    /// Compute the list of items this generator produces.
    fn generate_list(
        &mut self,
        id: &ItemId,
        objects: &[CookObject],
    ) -> Result<Vec<GeneratedSpec>, String>;

    /// Finalize one generated item's object set. May also push new
    /// objects onto the generator's own cache, which re-enters the
    /// generator's save preparation.
    fn populate(
        &mut self,
        generator: &ItemId,
        generated: &ItemId,
        generator_objects: &mut Vec<CookObject>,
        generated_objects: &[CookObject],
    ) -> Result<Vec<CookObject>, String>;

    /// Validate an item before save. Default accepts everything.
    fn validate(&mut self, _id: &ItemId, _objects: &[CookObject]) -> Result<(), String> {
        Ok(())
    }
}

/// Splitter lookup table, resolved once at session start.
#[derive(Default)]
pub struct SplitterRegistry {
    splitters: Vec<Box<dyn ItemSplitter>>,
}

impl SplitterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a splitter. Registration order is match priority.
    pub fn register(&mut self, splitter: Box<dyn ItemSplitter>) {
        self.splitters.push(splitter);
    }

    /// Resolve the splitter index for an item, if any matches.
    pub fn resolve(&self, id: &ItemId, objects: &[CookObject]) -> Option<usize> {
        self.splitters.iter().position(|s| s.matches(id, objects))
    }

    /// Splitter by resolved index.
    pub fn get_mut(&mut self, index: usize) -> &mut dyn ItemSplitter {
        self.splitters[index].as_mut()
    }

    /// Number of registered splitters.
    pub fn len(&self) -> usize {
        self.splitters.len()
    }

    /// Whether no splitters are registered.
    pub fn is_empty(&self) -> bool {
        self.splitters.is_empty()
    }
}

impl std::fmt::Debug for SplitterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.splitters.iter().map(|s| s.name()).collect();
        f.debug_struct("SplitterRegistry").field("splitters", &names).finish()
    }
}

/// Splitter that matches items containing an object of a marker class.
/// Each marker object becomes one generated item carrying a single
/// object named after it.
#[derive(Debug)]
pub struct ObjectClassSplitter {
    marker_class: String,
}

impl ObjectClassSplitter {
    /// Splitter keyed on `marker_class` (conventionally `generator`).
    pub fn new(marker_class: impl Into<String>) -> Self {
        Self { marker_class: marker_class.into() }
    }
}

impl ItemSplitter for ObjectClassSplitter {
    fn name(&self) -> &str {
        "object-class"
    }

    fn matches(&self, _id: &ItemId, objects: &[CookObject]) -> bool {
        objects.iter().any(|o| o.class == self.marker_class)
    }

    fn generate_list(
        &mut self,
        _id: &ItemId,
        objects: &[CookObject],
    ) -> Result<Vec<GeneratedSpec>, String> {
        Ok(objects
            .iter()
            .filter(|o| o.class == self.marker_class)
            .map(|o| GeneratedSpec {
                suffix: o.name.clone(),
                objects: vec![CookObject::new(o.name.clone(), "generated")],
            })
            .collect())
    }

    fn populate(
        &mut self,
        _generator: &ItemId,
        _generated: &ItemId,
        _generator_objects: &mut Vec<CookObject>,
        generated_objects: &[CookObject],
    ) -> Result<Vec<CookObject>, String> {
        Ok(generated_objects.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_spec_item_id() {
        let spec = GeneratedSpec { suffix: "tile0".to_string(), objects: vec![] };
        assert_eq!(
            spec.item_id(&ItemId::new("terrain/world")),
            ItemId::new("terrain/world/_generated_/tile0")
        );
    }

    #[test]
    fn test_object_class_splitter_matches() {
        let splitter = ObjectClassSplitter::new("generator");
        let objects = vec![
            CookObject::new("a", "mesh"),
            CookObject::new("tiles", "generator"),
        ];
        assert!(splitter.matches(&ItemId::new("x"), &objects));
        assert!(!splitter.matches(&ItemId::new("x"), &objects[..1]));
    }

    #[test]
    fn test_object_class_splitter_generate_list() {
        let mut splitter = ObjectClassSplitter::new("generator");
        let objects = vec![
            CookObject::new("t0", "generator"),
            CookObject::new("m", "mesh"),
            CookObject::new("t1", "generator"),
        ];
        let specs = splitter.generate_list(&ItemId::new("x"), &objects).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].suffix, "t0");
        assert_eq!(specs[1].suffix, "t1");
    }

    #[test]
    fn test_registry_resolution_order() {
        let mut registry = SplitterRegistry::new();
        registry.register(Box::new(ObjectClassSplitter::new("alpha")));
        registry.register(Box::new(ObjectClassSplitter::new("beta")));

        let both = vec![CookObject::new("a", "alpha"), CookObject::new("b", "beta")];
        // first registered wins
        assert_eq!(registry.resolve(&ItemId::new("x"), &both), Some(0));

        let beta_only = vec![CookObject::new("b", "beta")];
        assert_eq!(registry.resolve(&ItemId::new("x"), &beta_only), Some(1));

        let neither = vec![CookObject::new("m", "mesh")];
        assert_eq!(registry.resolve(&ItemId::new("x"), &neither), None);
    }
}
