#![no_main]

use libfuzzer_sys::fuzz_target;
use rc_types::{Output, TranscriptMarkers};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let markers = TranscriptMarkers::default();
    let output = Output::from_transcript(text, &markers);
    assert_eq!(output.completed, output.error_message.is_none());
    let _ = output.render_transcript(&markers);
});
