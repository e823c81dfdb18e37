//! Requirement sets grouped by extension layer.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::dimension::{ids, Dimension};
use crate::protocol::{Ability, ExtensionLayer};

type LayerMap = HashMap<ExtensionLayer, HashMap<String, Dimension>>;

/// Non-functional requirements of a call, keyed by extension layer.
///
/// Dimensions are unique by id within a layer. Reads and writes on one set
/// are mutually exclusive; unrelated sets never contend. `clone()` takes a
/// deep snapshot; share a set by wrapping it in an `Arc`.
#[derive(Debug, Default)]
pub struct RequirementSet {
    layers: RwLock<LayerMap>,
}

impl Clone for RequirementSet {
    fn clone(&self) -> Self {
        Self {
            layers: RwLock::new(self.read(Clone::clone)),
        }
    }
}

impl RequirementSet {
    /// Create an empty requirement set
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`RequirementSet::add_dimension`].
    pub fn with(self, layer: ExtensionLayer, dimension: Dimension) -> Self {
        self.add_dimension(layer, dimension);
        self
    }

    /// Add a dimension, replacing and returning any dimension with the same id.
    pub fn add_dimension(&self, layer: ExtensionLayer, dimension: Dimension) -> Option<Dimension> {
        self.write(|layers| {
            layers
                .entry(layer)
                .or_default()
                .insert(dimension.id().to_string(), dimension)
        })
    }

    /// Remove a dimension by id.
    pub fn remove_dimension(&self, layer: ExtensionLayer, id: &str) -> Option<Dimension> {
        self.write(|layers| {
            let dims = layers.get_mut(&layer)?;
            let removed = dims.remove(id);
            if dims.is_empty() {
                layers.remove(&layer);
            }
            removed
        })
    }

    /// Remove every dimension of a layer.
    pub fn remove_layer(&self, layer: ExtensionLayer) -> Vec<Dimension> {
        self.write(|layers| {
            layers
                .remove(&layer)
                .map(|dims| dims.into_values().collect())
                .unwrap_or_default()
        })
    }

    /// Look up one dimension.
    pub fn dimension(&self, layer: ExtensionLayer, id: &str) -> Option<Dimension> {
        self.read(|layers| layers.get(&layer)?.get(id).cloned())
    }

    /// All dimensions of a layer, sorted by id.
    pub fn dimensions(&self, layer: ExtensionLayer) -> Vec<Dimension> {
        let mut dims: Vec<Dimension> = self.read(|layers| {
            layers
                .get(&layer)
                .map(|dims| dims.values().cloned().collect())
                .unwrap_or_default()
        });
        dims.sort_by(|a, b| a.id().cmp(b.id()));
        dims
    }

    /// Layers that carry at least one dimension, in negotiation order.
    pub fn layers(&self) -> Vec<ExtensionLayer> {
        self.read(|layers| {
            ExtensionLayer::NEGOTIATION_ORDER
                .iter()
                .copied()
                .filter(|layer| layers.contains_key(layer))
                .collect()
        })
    }

    /// Whether no dimensions are present
    pub fn is_empty(&self) -> bool {
        self.read(HashMap::is_empty)
    }

    /// Whether the layer carries `required = true`.
    pub fn is_required(&self, layer: ExtensionLayer) -> bool {
        self.dimension(layer, ids::REQUIRED)
            .and_then(|dim| dim.hard().as_bool())
            .unwrap_or(false)
    }

    /// Ability named by the layer's `ability` dimension, if any.
    pub fn required_ability(&self, layer: ExtensionLayer) -> Option<Ability> {
        self.dimension(layer, ids::ABILITY)
            .and_then(|dim| dim.hard().as_int())
            .and_then(|code| u16::try_from(code).ok())
            .map(Ability::from_code)
    }

    fn read<T>(&self, f: impl FnOnce(&LayerMap) -> T) -> T {
        let guard = self.layers.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut LayerMap) -> T) -> T {
        let mut guard = self.layers.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
