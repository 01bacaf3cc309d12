use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::map::{is_map_file, PositionMap};
use crate::{Result, SourceMapError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedPosition {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePosition {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Registry of position maps keyed by source file path.
///
/// Shared between debug sessions behind an `Arc`; lookups take the read lock only.
#[derive(Debug, Default)]
pub struct PositionMapStore {
    maps: RwLock<HashMap<String, Arc<PositionMap>>>,
}

impl PositionMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every `*.map.json` document found directly inside `dir`.
    ///
    /// Returns the number of maps registered. The first unreadable or malformed document
    /// aborts the load; maps registered before it stay registered.
    pub fn load(&self, dir: &Path) -> Result<usize> {
        let entries = std::fs::read_dir(dir).map_err(|source| SourceMapError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SourceMapError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && is_map_file(&path) {
                paths.push(path);
            }
        }
        // Directory iteration order is platform dependent.
        paths.sort();

        for path in &paths {
            let map = PositionMap::load_file(path)?;
            tracing::debug!(
                path = %path.display(),
                source_file = %map.source_file,
                mappings = map.len(),
                "registered position map"
            );
            self.register(map);
        }

        tracing::info!(dir = %dir.display(), count = paths.len(), "loaded position maps");
        Ok(paths.len())
    }

    /// Insert `map`, replacing any map previously registered for the same source file.
    pub fn register(&self, map: PositionMap) {
        let key = map.source_file.clone();
        self.maps.write().insert(key, Arc::new(map));
    }

    /// Find the map for `source_file`.
    ///
    /// Clients usually send absolute paths while the compiler records project-relative ones, so
    /// a miss on the exact key falls back to component-wise suffix matching. The longest suffix
    /// wins; two maps matching equally well are ambiguous and yield `None`.
    pub fn get(&self, source_file: &str) -> Option<Arc<PositionMap>> {
        let maps = self.maps.read();
        if let Some(map) = maps.get(source_file) {
            return Some(map.clone());
        }
        best_matches(maps.values(), |map| map.source_file.as_str(), source_file)
            .and_then(|(_, mut matches)| {
                if matches.len() > 1 {
                    tracing::debug!(
                        source_file,
                        candidates = matches.len(),
                        "ambiguous position map lookup"
                    );
                    return None;
                }
                matches.pop().cloned()
            })
    }

    pub fn len(&self) -> usize {
        self.maps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.read().is_empty()
    }

    pub fn source_files(&self) -> Vec<String> {
        let mut files: Vec<_> = self.maps.read().keys().cloned().collect();
        files.sort();
        files
    }

    pub fn translate_to_generated(&self, source_file: &str, source_line: u32) -> Result<GeneratedPosition> {
        let map = self
            .get(source_file)
            .ok_or_else(|| SourceMapError::NoMapForFile(source_file.to_string()))?;

        let mapping = nearest_by(map.mappings.iter(), source_line, |m| {
            (m.source_line, m.source_column, m.generated_line)
        })
        .ok_or_else(|| SourceMapError::NoMappingFound(source_file.to_string()))?;

        Ok(GeneratedPosition {
            file: map.generated_file.clone(),
            line: mapping.generated_line,
            column: mapping.generated_column,
        })
    }

    /// Reverse lookup. Every map whose generated file matches with the longest path suffix
    /// takes part in the search.
    pub fn translate_to_source(&self, generated_file: &str, generated_line: u32) -> Result<SourcePosition> {
        let maps = self.maps.read();
        let Some((_, mut candidates)) =
            best_matches(maps.values(), |map| map.generated_file.as_str(), generated_file)
        else {
            return Err(SourceMapError::NoMapForFile(generated_file.to_string()));
        };
        // Ties across maps fall back to the source file name.
        candidates.sort_by(|a, b| a.source_file.cmp(&b.source_file));

        let mapped = candidates
            .iter()
            .flat_map(|map| map.mappings.iter().map(move |m| (map.source_file.as_str(), m)));
        let (file, mapping) = nearest_by(
            mapped,
            generated_line,
            |(_, m)| (m.generated_line, m.generated_column, m.source_line),
        )
        .ok_or_else(|| SourceMapError::NoMappingFound(generated_file.to_string()))?;

        Ok(SourcePosition {
            file: file.to_string(),
            line: mapping.source_line,
            column: mapping.source_column,
        })
    }
}

/// Scan `items` for the entry closest to `line`.
///
/// `key` yields `(queried line, queried column, opposite line)`. The smallest distance wins,
/// so an exact line match always does. Equal distances prefer the earlier line, then the lower
/// column, then the lower opposite line; the result never depends on insertion order.
fn nearest_by<T: Copy>(
    items: impl Iterator<Item = T>,
    line: u32,
    key: impl Fn(&T) -> (u32, u32, u32),
) -> Option<T> {
    let mut best: Option<(u32, (u32, u32, u32), T)> = None;

    for item in items {
        let k = key(&item);
        let distance = k.0.abs_diff(line);
        let better = match &best {
            None => true,
            Some((best_distance, best_key, _)) => (distance, k) < (*best_distance, *best_key),
        };
        if better {
            best = Some((distance, k, item));
        }
    }

    best.map(|(_, _, item)| item)
}

/// Number of trailing path components `recorded` and `queried` share when one is a suffix of
/// the other. Empty paths never match.
fn match_depth(recorded: &str, queried: &str) -> Option<usize> {
    if recorded.trim().is_empty() || queried.trim().is_empty() {
        return None;
    }
    let recorded = Path::new(recorded);
    let queried = Path::new(queried);
    if recorded.ends_with(queried) {
        Some(queried.components().count())
    } else if queried.ends_with(recorded) {
        Some(recorded.components().count())
    } else {
        None
    }
}

/// Every map in `maps` whose `path` matches `queried` at the greatest depth.
fn best_matches<'a>(
    maps: impl Iterator<Item = &'a Arc<PositionMap>>,
    path: impl Fn(&PositionMap) -> &str,
    queried: &str,
) -> Option<(usize, Vec<&'a Arc<PositionMap>>)> {
    let mut best: Option<(usize, Vec<&'a Arc<PositionMap>>)> = None;
    for map in maps {
        let Some(depth) = match_depth(path(map), queried) else {
            continue;
        };
        let best_depth = best.as_ref().map(|(best_depth, _)| *best_depth);
        match best_depth {
            Some(best_depth) if depth < best_depth => {}
            Some(best_depth) if depth == best_depth => {
                if let Some((_, matches)) = best.as_mut() {
                    matches.push(map);
                }
            }
            _ => best = Some((depth, vec![map])),
        }
    }
    best
}
