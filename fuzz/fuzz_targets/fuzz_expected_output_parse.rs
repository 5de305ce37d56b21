//! Expected-output files either fail with a line-numbered format error or
//! render back into a file that parses again.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rc_io::{ExpectedOutputFile, IoError};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    match ExpectedOutputFile::parse(text) {
        Ok(parsed) => {
            let rendered = parsed.render();
            assert!(ExpectedOutputFile::parse(&rendered).is_ok());
        }
        Err(IoError::Format { line, .. }) => assert!(line >= 1),
        Err(other) => panic!("unexpected parse error: {other}"),
    }
});
