#![no_main]

use libfuzzer_sys::fuzz_target;
use rc_generate::{format_template, placeholder_count, repeat};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (template, values) = text.split_once('\n').unwrap_or((text, "1L"));
    let values: Vec<&str> = values.split(',').collect();
    let arity = placeholder_count(template);
    let Ok(filled) = repeat(arity, &values) else {
        return;
    };
    // Arity taken from the template itself always formats.
    format_template(template, &filled).expect("matching arity formats");
    assert!(format_template(template, &[filled, vec!["x".to_owned()]].concat()).is_err());
});
