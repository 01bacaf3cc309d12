#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use tether_srcmap::{PositionMap, PositionMapStore};

mod utils;

fuzz_target!(|data: &[u8]| {
    let input = utils::truncate(data);
    let Ok(map) = PositionMap::from_json(Path::new("fuzz.map.json"), input) else {
        return;
    };
    // Blank paths never match anything.
    if map.source_file.trim().is_empty() || map.generated_file.trim().is_empty() {
        return;
    }

    let store = PositionMapStore::new();
    let source_file = map.source_file.clone();
    let generated_file = map.generated_file.clone();
    let lines: Vec<(u32, u32)> = map
        .mappings
        .iter()
        .map(|m| (m.source_line, m.generated_line))
        .collect();
    store.register(map);

    for (source_line, generated_line) in lines {
        // Every mapped line translates in both directions.
        let generated = store
            .translate_to_generated(&source_file, source_line)
            .expect("mapped source line translates");
        assert_eq!(generated.file, generated_file);

        let source = store
            .translate_to_source(&generated_file, generated_line)
            .expect("mapped generated line translates");
        assert_eq!(source.file, source_file);
    }
});
