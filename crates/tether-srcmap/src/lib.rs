//! Position maps between source-language files and the generated files they compile to.
//!
//! The compiler front end writes one `<basename>.map.json` document per compiled source
//! file. [`PositionMapStore`] loads those documents and answers nearest-match translation
//! queries in both directions.

mod map;
mod store;

pub use crate::map::{LineMapping, PositionMap, MAP_FILE_SUFFIX};
pub use crate::store::{GeneratedPosition, PositionMapStore, SourcePosition};

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SourceMapError>;

#[derive(Debug, Error)]
pub enum SourceMapError {
    #[error("no position map registered for {0}")]
    NoMapForFile(String),

    #[error("position map for {0} has no mappings")]
    NoMappingFound(String),

    #[error("failed to read position map {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse position map {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
