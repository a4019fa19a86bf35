//! Fuzz target for DocumentId normalization
//!
//! # Invariants
//!
//! - Never panics on arbitrary UTF-8
//! - Normalization is idempotent
//! - Normalized ids carry no query, fragment, backslash, empty or `.` segment

#![no_main]

use cowrite_core::DocumentId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|raw: &str| {
    let Ok(id) = DocumentId::new(raw) else {
        return;
    };
    let text = id.as_str();

    assert_eq!(DocumentId::new(text).expect("normalized id is valid"), id);
    assert!(!text.contains(['?', '#', '\\']));
    assert!(!text.ends_with('/'));
    let body = text.strip_prefix('/').unwrap_or(text);
    assert!(body.split('/').all(|segment| !segment.is_empty() && segment != "."));
});
