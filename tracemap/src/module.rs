//! Loaded map registry
//!
//! Maps are created by whatever loaded the instrumentation programs; this
//! registry only enumerates what the kernel reports and opens tables by
//! name or id. Key/leaf layouts are supplied separately, keyed by table name.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::domain::{MapId, TableError};
use crate::table::kernel::descriptor_from_info;
use crate::table::{KernelMap, LayoutSpec, MapBackend, MapDescriptor, MapTable};

/// Kernel object names are cut to 15 bytes plus NUL
const OBJ_NAME_LEN: usize = 15;

/// Snapshot of loaded maps, plus optional layouts per table name
#[derive(Debug, Default)]
pub struct MapRegistry {
    maps: Vec<MapDescriptor>,
    layouts: HashMap<String, LayoutSpec>,
}

impl MapRegistry {
    /// Enumerate every map currently loaded in the kernel
    ///
    /// Maps of types this build cannot decode are skipped.
    ///
    /// # Errors
    /// Returns an error if map enumeration is not permitted
    pub fn from_kernel() -> Result<Self, TableError> {
        let mut maps = Vec::new();
        for info in aya::maps::loaded_maps() {
            let info = info.map_err(|e| TableError::Descriptor(format!("enumerating maps: {e}")))?;
            match descriptor_from_info(&info) {
                Ok(descriptor) => maps.push(descriptor),
                Err(e) => debug!("Skipping map {}: {e}", info.id()),
            }
        }
        info!("Found {} loaded maps", maps.len());
        Ok(Self::from_descriptors(maps))
    }

    #[must_use]
    pub fn from_descriptors(maps: Vec<MapDescriptor>) -> Self {
        Self { maps, layouts: HashMap::new() }
    }

    /// Attach layouts from a JSON file of the form
    /// `{ "<table>": { "key": <descriptor>, "leaf": <descriptor> }, ... }`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not valid JSON
    pub fn load_layouts(&mut self, path: &Path) -> Result<(), TableError> {
        let text = fs::read_to_string(path)?;
        let layouts: HashMap<String, LayoutSpec> = serde_json::from_str(&text)
            .map_err(|e| TableError::Descriptor(format!("{}: {e}", path.display())))?;
        debug!("Loaded {} table layouts from {}", layouts.len(), path.display());
        self.layouts.extend(layouts);
        Ok(())
    }

    pub fn set_layout(&mut self, table: &str, layout: LayoutSpec) {
        self.layouts.insert(table.to_string(), layout);
    }

    #[must_use]
    pub fn descriptors(&self) -> &[MapDescriptor] {
        &self.maps
    }

    /// Id of the table called `name`
    ///
    /// Names longer than the kernel keeps also match their truncated form.
    /// When several maps share a name the most recently created one (the
    /// highest id) wins.
    #[must_use]
    pub fn table_id_by_name(&self, name: &str) -> Option<MapId> {
        let truncated = name.get(..OBJ_NAME_LEN).unwrap_or(name);
        self.maps
            .iter()
            .filter(|m| m.name == name || m.name == truncated)
            .map(|m| m.id)
            .max()
    }

    #[must_use]
    pub fn descriptor_for(&self, id: MapId) -> Option<&MapDescriptor> {
        self.maps.iter().find(|m| m.id == id)
    }

    /// Open a kernel table by name, with its layout if one is registered
    ///
    /// # Errors
    /// Returns an error if no table has that name or the map cannot be opened
    pub fn open_table(&self, name: &str) -> Result<MapTable<KernelMap>, TableError> {
        let id = self
            .table_id_by_name(name)
            .ok_or_else(|| TableError::Descriptor(format!("no table named {name}")))?;
        self.with_layout(name, MapTable::new(KernelMap::from_id(id)?))
    }

    /// Open a kernel table by id, with the layout registered for its name
    ///
    /// # Errors
    /// Returns an error if the map cannot be opened
    pub fn open_table_by_id(&self, id: MapId) -> Result<MapTable<KernelMap>, TableError> {
        let table = MapTable::new(KernelMap::from_id(id)?);
        match self.descriptor_for(id).map(|d| d.name.clone()) {
            Some(name) => self.with_layout(&name, table),
            None => Ok(table),
        }
    }

    /// Install the layout registered for `name` on a table, checking that
    /// its sizes agree with the map
    ///
    /// # Errors
    /// Returns [`TableError::Descriptor`] for a malformed or mismatched layout
    pub fn with_layout<B: MapBackend>(&self, name: &str, table: MapTable<B>) -> Result<MapTable<B>, TableError> {
        let Some(spec) = self.layouts.get(name) else {
            return Ok(table);
        };
        let (key, leaf) = spec.build().map_err(|e| TableError::Descriptor(format!("{name}: {e}")))?;

        let descriptor = table.descriptor()?;
        if key.size() != descriptor.key_size || leaf.size() != descriptor.leaf_size {
            return Err(TableError::Descriptor(format!(
                "{name}: layout is {}/{} bytes but the map uses {}/{}",
                key.size(),
                leaf.size(),
                descriptor.key_size,
                descriptor.leaf_size
            )));
        }
        Ok(table.with_formatters(Arc::new(key), Arc::new(leaf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{MapKind, MemoryMap};
    use serde_json::json;

    fn descriptor(id: u32, name: &str) -> MapDescriptor {
        MapDescriptor {
            id: MapId(id),
            name: name.to_string(),
            key_size: 4,
            leaf_size: 8,
            kind: MapKind::Generic,
            capacity: 16,
        }
    }

    #[test]
    fn test_table_id_by_name() {
        let registry = MapRegistry::from_descriptors(vec![
            descriptor(3, "counts"),
            descriptor(9, "counts"),
            descriptor(4, "stack_traces_ve"),
        ]);
        assert_eq!(registry.table_id_by_name("counts"), Some(MapId(9)));
        assert_eq!(registry.table_id_by_name("stack_traces_very_long"), Some(MapId(4)));
        assert_eq!(registry.table_id_by_name("missing"), None);
        assert_eq!(registry.descriptor_for(MapId(4)).unwrap().name, "stack_traces_ve");
    }

    #[test]
    fn test_layout_is_attached() {
        let mut registry = MapRegistry::default();
        registry.set_layout(
            "counts",
            serde_json::from_value(json!({ "key": "unsigned int", "leaf": "unsigned long long" })).unwrap(),
        );
        let table = registry.with_layout("counts", MapTable::new(MemoryMap::new(descriptor(1, "counts")))).unwrap();
        let config = table.config().unwrap();
        assert_eq!(config.key_desc.as_deref(), Some("unsigned int"));
        assert_eq!(table.key_to_string(&7u32.to_ne_bytes()).unwrap(), "0x7");
    }

    #[test]
    fn test_layout_size_mismatch_is_rejected() {
        let mut registry = MapRegistry::default();
        registry.set_layout("counts", serde_json::from_value(json!({ "key": "char", "leaf": "int" })).unwrap());
        let err = registry
            .with_layout("counts", MapTable::new(MemoryMap::new(descriptor(1, "counts"))))
            .err()
            .unwrap();
        assert!(matches!(err, TableError::Descriptor(_)));
    }

    #[test]
    fn test_load_layouts_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layouts.json");
        fs::write(&path, r#"{"counts": {"key": "int", "leaf": "unsigned long long"}}"#).unwrap();
        let mut registry = MapRegistry::default();
        registry.load_layouts(&path).unwrap();
        assert!(registry.layouts.contains_key("counts"));
    }
}
