//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Timed work uses
//! `tokio::time::interval`, `tokio::time::timeout`, or waits on a channel or
//! cancellation token.
//!
//! **Exceptions**: test code.

use architectural_enforcement::{code_part, production_sources, Violation};

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if code.contains("::sleep(") || code.contains(".sleep(") || code.contains("sleep_until(") {
                violations.push(Violation {
                    path: file.path.clone(),
                    line: idx + 1,
                    reason: "Sleep call",
                    text: line.clone(),
                });
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use instead:");
        eprintln!("  - tokio::time::interval() for periodic tasks");
        eprintln!("  - tokio::time::timeout() for deadlines");
        eprintln!("  - channels, Notify, or CancellationToken to wait for events");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_production_sources_are_found() {
    let files = production_sources();
    assert!(
        files.iter().any(|f| f.path.ends_with("gateway/core/src/lib.rs")),
        "scanner did not find the core crate"
    );
    assert!(files
        .iter()
        .any(|f| f.path.ends_with("gateway/daemon/src/main.rs")));
}
