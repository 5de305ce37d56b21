#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use rc_io::{parse_case_stream, parse_case_table};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    for name in ["fuzz.json", "fuzz.yaml"] {
        if let Ok(table) = parse_case_table(text, Path::new(name)) {
            // Generator expansion must reject bad templates, never panic.
            let _ = table.into_cases(Path::new(name));
        }
    }
    let _ = parse_case_stream(text, Path::new("fuzz.jsonl"));
});
