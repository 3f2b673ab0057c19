//! Every query runs on SQLite; Postgres syntax compiles fine and only fails at runtime.

use std::fs;
use std::path::{Path, PathBuf};

const FORBIDDEN: &[(&str, &str)] = &[
    ("ILIKE", "use LIKE, SQLite's LIKE is already case-insensitive for ASCII"),
    ("NOW()", "bind a timestamp from chrono instead"),
    ("INTERVAL '", "compute the cutoff in Rust and bind it"),
    ("::text", "SQLite has no :: casts"),
    ("::int", "SQLite has no :: casts"),
    ("::bigint", "SQLite has no :: casts"),
    ("::jsonb", "SQLite has no :: casts"),
    ("::timestamptz", "SQLite has no :: casts"),
    ("SERIAL", "use INTEGER PRIMARY KEY AUTOINCREMENT"),
];

fn sources(dir: &Path, ext: &str, out: &mut Vec<PathBuf>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            sources(&path, ext, out);
        } else if path.extension().is_some_and(|e| e == ext) {
            out.push(path);
        }
    }
}

/// `token` not directly followed by an identifier character, so `::int`
/// does not match `::into`.
fn contains_token(line: &str, token: &str) -> bool {
    line.match_indices(token).any(|(at, _)| {
        line[at + token.len()..]
            .chars()
            .next()
            .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '_'))
    })
}

fn positional_placeholder(line: &str) -> bool {
    line.as_bytes().windows(2).any(|w| w[0] == b'$' && w[1].is_ascii_digit())
}

#[test]
fn queries_use_sqlite_syntax() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    sources(&root.join("src"), "rs", &mut files);
    sources(&root.join("migrations"), "sql", &mut files);
    assert!(files.len() > 5, "found only {:?}", files);

    let mut problems = Vec::new();
    for file in &files {
        let text = fs::read_to_string(file).unwrap();
        for (n, line) in text.lines().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("//") || trimmed.starts_with("--") {
                continue;
            }
            for (token, hint) in FORBIDDEN {
                if contains_token(line, token) {
                    problems.push(format!("{}:{}: {} ({})", file.display(), n + 1, token, hint));
                }
            }
            if positional_placeholder(line) {
                problems.push(format!("{}:{}: $N placeholder (use ?)", file.display(), n + 1));
            }
        }
    }

    assert!(problems.is_empty(), "Postgres syntax found:\n{}", problems.join("\n"));
}

#[test]
fn token_matching_ignores_rust_paths() {
    assert!(!contains_token("let v: i64 = Json::into(x);", "::int"));
    assert!(contains_token("SELECT id::int FROM t", "::int"));
    assert!(positional_placeholder("WHERE id = $1"));
    assert!(!positional_placeholder("WHERE id = ?"));
}
