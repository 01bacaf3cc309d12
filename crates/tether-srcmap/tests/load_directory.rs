use std::fs;

use tempfile::TempDir;
use tether_srcmap::{PositionMapStore, SourceMapError};

fn write_map(dir: &TempDir, name: &str, body: &str) {
    fs::write(dir.path().join(name), body).unwrap();
}

#[test]
fn load_registers_every_map_file_in_directory() {
    let dir = TempDir::new().unwrap();
    write_map(
        &dir,
        "main.map.json",
        r#"{"sourceFile":"src/main.src","generatedFile":"gen/main.go","mappings":[
            {"sourceLine":1,"sourceColumn":1,"generatedLine":7,"generatedColumn":1},
            {"sourceLine":4,"sourceColumn":1,"generatedLine":19,"generatedColumn":1}
        ]}"#,
    );
    write_map(
        &dir,
        "util.map.json",
        r#"{"sourceFile":"src/util.src","generatedFile":"gen/util.go","mappings":[]}"#,
    );
    // Not a position map; must be skipped.
    write_map(&dir, "notes.json", "not json at all");
    fs::create_dir(dir.path().join("nested.map.json")).unwrap();

    let store = PositionMapStore::new();
    let count = store.load(dir.path()).unwrap();

    assert_eq!(count, 2);
    assert_eq!(store.source_files(), vec!["src/main.src", "src/util.src"]);
    assert_eq!(store.translate_to_generated("src/main.src", 4).unwrap().line, 19);
    assert!(matches!(
        store.translate_to_generated("src/util.src", 1),
        Err(SourceMapError::NoMappingFound(_))
    ));
}

#[test]
fn load_reports_malformed_documents() {
    let dir = TempDir::new().unwrap();
    write_map(&dir, "bad.map.json", r#"{"sourceFile": 3}"#);

    let err = PositionMapStore::new().load(dir.path()).unwrap_err();
    match err {
        SourceMapError::Json { path, .. } => assert!(path.ends_with("bad.map.json")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn load_of_missing_directory_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("does-not-exist");
    assert!(matches!(
        PositionMapStore::new().load(&missing),
        Err(SourceMapError::Io { .. })
    ));
}

#[test]
fn concurrent_readers_see_consistent_results() {
    let store = std::sync::Arc::new(PositionMapStore::new());
    store.register(
        tether_srcmap::PositionMap::new("a.src", "a.go")
            .with_mappings([tether_srcmap::LineMapping::new(10, 1, 15, 1)]),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                for line in 0..200 {
                    assert_eq!(store.translate_to_generated("a.src", line).unwrap().line, 15);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
