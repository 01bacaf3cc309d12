use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tether_srcmap::GeneratedPosition;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("no breakpoint with id {0}")]
    NotFound(u64),
}

/// Everything needed to record a breakpoint; the catalog assigns the id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBreakpoint {
    pub source_file: String,
    pub source_line: u32,
    /// `None` when the source line could not be translated.
    pub generated: Option<GeneratedPosition>,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
    pub verified: bool,
    pub native_id: Option<i64>,
    /// Why the breakpoint is not verified.
    pub message: Option<String>,
}

#[derive(Debug)]
pub struct CatalogEntry {
    id: u64,
    pub source_file: String,
    pub source_line: u32,
    pub generated: Option<GeneratedPosition>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
    verified: AtomicBool,
    condition: Mutex<Option<String>>,
    native_id: Mutex<Option<i64>>,
    message: Mutex<Option<String>>,
}

impl CatalogEntry {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    pub fn set_verified(&self, verified: bool) {
        self.verified.store(verified, Ordering::Release);
    }

    pub fn condition(&self) -> Option<String> {
        self.condition.lock().clone()
    }

    pub fn set_condition(&self, condition: Option<String>) {
        *self.condition.lock() = condition;
    }

    /// Id of the breakpoint in the native debugger, while one is installed.
    pub fn native_id(&self) -> Option<i64> {
        *self.native_id.lock()
    }

    pub fn set_native_id(&self, native_id: Option<i64>) {
        *self.native_id.lock() = native_id;
    }

    pub fn message(&self) -> Option<String> {
        self.message.lock().clone()
    }

    pub fn set_message(&self, message: Option<String>) {
        *self.message.lock() = message;
    }

    pub fn is_logpoint(&self) -> bool {
        self.log_message.is_some()
    }

    /// DAP `Breakpoint` object as reported to the client.
    pub fn to_dap(&self) -> Value {
        let mut body = json!({
            "id": self.id,
            "verified": self.is_verified(),
            "line": self.source_line,
            "source": { "path": self.source_file },
        });
        if let Some(message) = self.message() {
            body["message"] = json!(message);
        }
        body
    }
}

/// Breakpoints known to the adapter, keyed by a process-wide monotonically increasing id.
#[derive(Debug)]
pub struct BreakpointCatalog {
    next_id: AtomicU64,
    entries: RwLock<BTreeMap<u64, Arc<CatalogEntry>>>,
}

impl Default for BreakpointCatalog {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl BreakpointCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, breakpoint: NewBreakpoint) -> Arc<CatalogEntry> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CatalogEntry {
            id,
            source_file: breakpoint.source_file,
            source_line: breakpoint.source_line,
            generated: breakpoint.generated,
            hit_condition: breakpoint.hit_condition,
            log_message: breakpoint.log_message,
            verified: AtomicBool::new(breakpoint.verified),
            condition: Mutex::new(breakpoint.condition),
            native_id: Mutex::new(breakpoint.native_id),
            message: Mutex::new(breakpoint.message),
        });
        self.entries.write().insert(id, entry.clone());
        entry
    }

    pub fn remove(&self, id: u64) -> Result<Arc<CatalogEntry>, CatalogError> {
        self.entries.write().remove(&id).ok_or(CatalogError::NotFound(id))
    }

    /// Remove every id in `ids` under a single write lock; unknown ids are skipped.
    pub fn remove_many(&self, ids: impl IntoIterator<Item = u64>) -> usize {
        let mut entries = self.entries.write();
        ids.into_iter()
            .filter(|id| entries.remove(id).is_some())
            .count()
    }

    pub fn get(&self, id: u64) -> Result<Arc<CatalogEntry>, CatalogError> {
        self.entries.read().get(&id).cloned().ok_or(CatalogError::NotFound(id))
    }

    pub fn list_by_source_location(&self, file: &str, line: u32) -> Vec<Arc<CatalogEntry>> {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.source_file == file && entry.source_line == line)
            .cloned()
            .collect()
    }

    pub fn list_by_generated_location(&self, file: &str, line: u32) -> Vec<Arc<CatalogEntry>> {
        self.entries
            .read()
            .values()
            .filter(|entry| {
                entry
                    .generated
                    .as_ref()
                    .is_some_and(|pos| pos.file == file && pos.line == line)
            })
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<Arc<CatalogEntry>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn clear_by_source_file(&self, file: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.source_file != file);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn bp(file: &str, line: u32, generated_line: u32) -> NewBreakpoint {
        NewBreakpoint {
            source_file: file.to_string(),
            source_line: line,
            generated: Some(GeneratedPosition {
                file: format!("{file}.go"),
                line: generated_line,
                column: 1,
            }),
            verified: true,
            ..NewBreakpoint::default()
        }
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let catalog = BreakpointCatalog::new();
        assert_eq!(catalog.add(bp("a.src", 1, 10)).id(), 1);
        assert_eq!(catalog.add(bp("a.src", 2, 20)).id(), 2);
        catalog.remove(2).unwrap();
        assert_eq!(catalog.add(bp("a.src", 3, 30)).id(), 3);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let catalog = BreakpointCatalog::new();
        assert_eq!(catalog.get(9).unwrap_err(), CatalogError::NotFound(9));
        assert_eq!(catalog.remove(9).unwrap_err(), CatalogError::NotFound(9));
    }

    #[test]
    fn removed_ids_are_not_found() {
        let catalog = BreakpointCatalog::new();
        let kept = catalog.add(bp("a.src", 1, 10)).id();
        let removed = catalog.add(bp("a.src", 2, 20)).id();

        assert_eq!(catalog.remove(removed).unwrap().id(), removed);
        assert_eq!(catalog.get(removed).unwrap_err(), CatalogError::NotFound(removed));
        assert_eq!(catalog.remove(removed).unwrap_err(), CatalogError::NotFound(removed));
        assert_eq!(catalog.get(kept).unwrap().id(), kept);
    }

    #[test]
    fn lookups_by_location() {
        let catalog = BreakpointCatalog::new();
        let a = catalog.add(bp("a.src", 5, 50));
        catalog.add(bp("b.src", 5, 50));
        catalog.add(NewBreakpoint {
            source_file: "a.src".to_string(),
            source_line: 6,
            ..NewBreakpoint::default()
        });

        let by_source = catalog.list_by_source_location("a.src", 5);
        assert_eq!(by_source.len(), 1);
        assert_eq!(by_source[0].id(), a.id());

        let by_generated = catalog.list_by_generated_location("a.src.go", 50);
        assert_eq!(by_generated.len(), 1);
        assert!(catalog.list_by_generated_location("a.src.go", 60).is_empty());
    }

    #[test]
    fn clear_by_source_file_leaves_other_files() {
        let catalog = BreakpointCatalog::new();
        catalog.add(bp("a.src", 1, 10));
        catalog.add(bp("a.src", 2, 20));
        catalog.add(bp("b.src", 1, 10));

        assert_eq!(catalog.clear_by_source_file("a.src"), 2);
        let remaining = catalog.list_all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].source_file, "b.src");

        catalog.clear();
        assert!(catalog.is_empty());
    }

    #[test]
    fn remove_many_skips_unknown_ids() {
        let catalog = BreakpointCatalog::new();
        let a = catalog.add(bp("a.src", 1, 10));
        let b = catalog.add(bp("a.src", 2, 20));
        assert_eq!(catalog.remove_many([a.id(), b.id(), 99]), 2);
        assert_eq!(catalog.len(), 0);
    }

    #[test]
    fn entry_fields_are_independently_mutable() {
        let catalog = BreakpointCatalog::new();
        let entry = catalog.add(NewBreakpoint {
            condition: Some("x > 1".to_string()),
            ..bp("a.src", 1, 10)
        });
        let same = catalog.get(entry.id()).unwrap();

        entry.set_verified(false);
        entry.set_condition(None);
        assert!(!same.is_verified());
        assert_eq!(same.condition(), None);
        assert_eq!(same.to_dap()["verified"], false);
    }

    #[test]
    fn concurrent_adds_produce_unique_ids() {
        let catalog = Arc::new(BreakpointCatalog::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let catalog = catalog.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| catalog.add(bp("a.src", t * 100 + i, i)).id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: BTreeSet<u64> = threads
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 800);
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&800));
        assert_eq!(catalog.len(), 800);
    }
}
