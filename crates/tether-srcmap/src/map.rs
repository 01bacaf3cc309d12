use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, SourceMapError};

/// File name suffix used by the compiler for serialized position maps.
pub const MAP_FILE_SUFFIX: &str = ".map.json";

/// One correspondence between a source position and a generated position.
///
/// Lines and columns are 1-based, matching what the compiler emits and what DAP clients
/// send by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineMapping {
    pub source_line: u32,
    #[serde(default)]
    pub source_column: u32,
    pub generated_line: u32,
    #[serde(default)]
    pub generated_column: u32,
}

impl LineMapping {
    pub fn new(source_line: u32, source_column: u32, generated_line: u32, generated_column: u32) -> Self {
        Self {
            source_line,
            source_column,
            generated_line,
            generated_column,
        }
    }
}

/// All mappings for one compiled source file.
///
/// `mappings` is kept in the order the compiler wrote it. Neither ordering nor uniqueness
/// is assumed by the lookups in [`crate::PositionMapStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionMap {
    pub source_file: String,
    pub generated_file: String,
    #[serde(default)]
    pub mappings: Vec<LineMapping>,
}

impl PositionMap {
    pub fn new(source_file: impl Into<String>, generated_file: impl Into<String>) -> Self {
        Self {
            source_file: source_file.into(),
            generated_file: generated_file.into(),
            mappings: Vec::new(),
        }
    }

    pub fn with_mappings(mut self, mappings: impl IntoIterator<Item = LineMapping>) -> Self {
        self.mappings.extend(mappings);
        self
    }

    pub fn push(&mut self, mapping: LineMapping) {
        self.mappings.push(mapping);
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Parse a map document. `origin` is only used for error reporting.
    pub fn from_json(origin: &Path, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|source| SourceMapError::Json {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|source| SourceMapError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(path, &bytes)
    }
}

pub(crate) fn is_map_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.len() > MAP_FILE_SUFFIX.len() && name.ends_with(MAP_FILE_SUFFIX))
}
