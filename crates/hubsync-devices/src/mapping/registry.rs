//! Mapping registry: device type → IO patterns → entries.
//!
//! A registry is immutable once built. Overrides produce a new registry
//! which is published through [`SharedRegistry::swap`]; readers holding the
//! previous `Arc` keep a consistent view.

use std::collections::HashMap;
use std::sync::Arc;

use hubsync_core::config::MappingOverrideConfig;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use super::entry::{DeviceRole, KeyPattern, MappingEntry, SemanticRole, StateClass};
use super::rule::ConversionRule;
use crate::error::MappingResult;

/// All entries of one device type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceTypeMapping {
    pub type_id: String,
    /// Role reported when the type has no classifier.
    pub default_role: DeviceRole,
    /// Kept sorted by pattern precedence.
    pub entries: Vec<(KeyPattern, MappingEntry)>,
}

impl DeviceTypeMapping {
    pub fn new(type_id: impl Into<String>, default_role: DeviceRole) -> Self {
        Self {
            type_id: type_id.into(),
            default_role,
            entries: Vec::new(),
        }
    }

    /// Add an entry, replacing one with an identical pattern.
    pub fn with(mut self, pattern: KeyPattern, entry: MappingEntry) -> Self {
        self.upsert(pattern, entry);
        self
    }

    pub fn upsert(&mut self, pattern: KeyPattern, entry: MappingEntry) {
        match self.entries.iter_mut().find(|(p, _)| *p == pattern) {
            Some(slot) => slot.1 = entry,
            None => {
                self.entries.push((pattern, entry));
                // Stable: keeps declaration order within one precedence level.
                self.entries.sort_by_key(|(p, _)| p.precedence());
            }
        }
    }

    /// Entry for `io_key`, honouring exact → any-of → indexed precedence.
    pub fn resolve(&self, io_key: &str) -> Option<&MappingEntry> {
        self.resolve_with_pattern(io_key).map(|(_, e)| e)
    }

    pub fn resolve_with_pattern(&self, io_key: &str) -> Option<(&KeyPattern, &MappingEntry)> {
        self.entries
            .iter()
            .find(|(p, _)| p.matches(io_key))
            .map(|(p, e)| (p, e))
    }

    /// Expand patterns against the keys a device actually reports.
    ///
    /// Indexed patterns yield one item per matching channel, so `L*` against
    /// `{L1, L2, L3, V}` gives `L1`, `L2`, `L3`. Keys no pattern matches are
    /// left out.
    pub fn expand<'a, I>(&'a self, keys: I) -> Vec<(&'a str, &'a MappingEntry)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter()
            .filter_map(|k| self.resolve(k).map(|e| (k, e)))
            .collect()
    }

    /// The selector pattern and its classifier, if the type has one.
    pub fn classifier(&self) -> Option<(&KeyPattern, &super::entry::Classifier)> {
        self.entries
            .iter()
            .find_map(|(p, e)| e.classifier.as_ref().map(|c| (p, c)))
    }
}

/// Immutable lookup table keyed by device type identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappingRegistry {
    types: HashMap<String, DeviceTypeMapping>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in device table.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for mapping in super::builtin::device_types() {
            registry.insert(mapping);
        }
        registry
    }

    pub fn insert(&mut self, mapping: DeviceTypeMapping) {
        self.types.insert(mapping.type_id.clone(), mapping);
    }

    pub fn device_type(&self, type_id: &str) -> Option<&DeviceTypeMapping> {
        self.types.get(type_id)
    }

    /// Entry for one IO of one device type. Absence is a normal outcome.
    pub fn resolve(&self, type_id: &str, io_key: &str) -> Option<&MappingEntry> {
        self.types.get(type_id)?.resolve(io_key)
    }

    pub fn type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.types.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// New registry with configured overrides applied on top of this one.
    pub fn with_overrides(&self, overrides: &[MappingOverrideConfig]) -> MappingResult<Self> {
        let mut next = self.clone();
        for o in overrides {
            let pattern: KeyPattern = o.io.parse()?;
            let role: SemanticRole = o.role.parse()?;
            let rule: ConversionRule = o.rule.parse()?;
            let state_class = o
                .state_class
                .as_deref()
                .map(str::parse::<StateClass>)
                .transpose()?;

            let mapping = next
                .types
                .entry(o.device_type.clone())
                .or_insert_with(|| DeviceTypeMapping::new(o.device_type.clone(), DeviceRole::Generic));
            let classifier = mapping
                .entries
                .iter()
                .find(|(p, _)| *p == pattern)
                .and_then(|(_, e)| e.classifier.clone());

            mapping.upsert(
                pattern.clone(),
                MappingEntry {
                    role,
                    unit: o.unit.clone(),
                    state_class,
                    rule,
                    classifier,
                },
            );
            info!(
                category = "mapping",
                device_type = %o.device_type,
                io = %pattern,
                rule = %rule,
                "Applied mapping override"
            );
        }
        Ok(next)
    }
}

/// Atomically swappable registry handle.
#[derive(Debug)]
pub struct SharedRegistry {
    current: RwLock<Arc<MappingRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: MappingRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    /// The registry in effect right now.
    pub fn current(&self) -> Arc<MappingRegistry> {
        Arc::clone(&self.current.read())
    }

    /// Publish a new registry and return the previous one.
    ///
    /// Devices already in the store keep their old interpretation until the
    /// next full rebuild.
    pub fn swap(&self, registry: MappingRegistry) -> Arc<MappingRegistry> {
        std::mem::replace(&mut *self.current.write(), Arc::new(registry))
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new(MappingRegistry::builtin())
    }
}
