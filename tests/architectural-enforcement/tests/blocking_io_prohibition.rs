//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async functions MUST NOT perform blocking I/O. Use
//! `tokio::fs`, `tokio::net`, `tokio::process`, and async `reqwest`.
//!
//! **Acceptable**: blocking calls in plain `fn`s (config loading before the
//! runtime, PID files, socket setup) and in test code.

use architectural_enforcement::{code_part, enclosing_fn, production_sources, FnContext, Violation};

fn blocking_reason(code: &str, fs_imported: bool, net_imported: bool) -> Option<&'static str> {
    if code.contains("std::fs::") || (fs_imported && code.contains(" fs::")) {
        return Some("Blocking file I/O");
    }
    if code.contains("std::net::") || (net_imported && code.contains(" net::")) {
        return Some("Blocking network I/O");
    }
    if code.contains("std::process::Command") {
        return Some("Blocking process I/O");
    }
    if code.contains("reqwest::blocking") {
        return Some("Blocking HTTP client");
    }
    if code.contains("std::io::stdin()") || code.contains("std::thread::sleep") {
        return Some("Blocking call");
    }
    None
}

#[test]
fn test_no_blocking_io_in_async_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        let fs_imported = file.imports("std::fs");
        let net_imported = file.imports("std::net");

        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            let Some(reason) = blocking_reason(code, fs_imported, net_imported) else {
                continue;
            };
            if enclosing_fn(&file.lines, idx) == FnContext::Async {
                violations.push(Violation {
                    path: file.path.clone(),
                    line: idx + 1,
                    reason,
                    text: line.clone(),
                });
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O found inside async functions!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Move the call into a plain fn that runs before the runtime,");
        eprintln!("   or use the tokio equivalent.");

        panic!(
            "\nFound {} blocking I/O violation(s) in async code.",
            violations.len()
        );
    }
}

#[test]
fn test_no_blocking_http_client_anywhere() {
    let offenders: Vec<String> = production_sources()
        .into_iter()
        .filter(|f| f.lines.iter().any(|l| code_part(l).contains("reqwest::blocking")))
        .map(|f| f.path.display().to_string())
        .collect();
    assert!(offenders.is_empty(), "reqwest::blocking used in {offenders:?}");
}

#[test]
fn test_detector_flags_fs_in_async_fn() {
    assert_eq!(
        blocking_reason("    let s = fs::read_to_string(p)?;", true, false),
        Some("Blocking file I/O")
    );
    assert_eq!(blocking_reason("    let s = tokio::fs::read(p).await?;", false, false), None);
}
