use std::collections::HashMap;

use super::GrainTable;

/// Loaded grain tables keyed by grain-table index.
///
/// Entries are never evicted; a table stays loaded until the extent is dropped.
#[derive(Debug, Default)]
pub struct GrainTableCache {
    tables: HashMap<u32, GrainTable>,
}

impl GrainTableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: u32) -> Option<&GrainTable> {
        self.tables.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut GrainTable> {
        self.tables.get_mut(&index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.tables.contains_key(&index)
    }

    pub fn insert(&mut self, index: u32, table: GrainTable) {
        self.tables.insert(index, table);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
