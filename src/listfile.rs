//! Newline-delimited list files.
//!
//! The launcher's plain-text inputs (domain allow-list, package list,
//! pinned-version file) share one format: one entry per line, `#` starts a
//! comment, blank lines are ignored.

use std::fs;
use std::io;
use std::path::Path;

/// Parses list-file text into its entries, preserving order.
///
/// Inline comments are stripped, so `github.com # code host` yields
/// `github.com`.
#[must_use]
pub fn parse(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let entry = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let entry = entry.trim();
            if entry.is_empty() {
                None
            } else {
                Some(entry.to_string())
            }
        })
        .collect()
}

/// Reads and parses a list file.
pub fn read(path: &Path) -> io::Result<Vec<String>> {
    Ok(parse(&fs::read_to_string(path)?))
}

/// Reads and parses a list file, treating a missing file as empty.
pub fn read_optional(path: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse(&text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let text = "# header\n\napi.github.com\n  registry.npmjs.org  \n# tail\n";
        assert_eq!(parse(text), ["api.github.com", "registry.npmjs.org"]);
    }

    #[test]
    fn test_parse_strips_inline_comments() {
        assert_eq!(parse("github.com # code host"), ["github.com"]);
        assert_eq!(parse("   # only a comment"), Vec::<String>::new());
    }

    #[test]
    fn test_read_optional_missing_file() {
        let path = std::env::temp_dir().join("ssm-test-listfile-missing.txt");
        let entries = read_optional(&path).expect("missing file is empty");
        assert!(entries.is_empty());
    }

    #[test]
    fn test_read_roundtrip() {
        let dir = std::env::temp_dir().join(format!("ssm-test-listfile-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("list.txt");
        fs::write(&path, "alpha\n# skip\nbeta\n").expect("write list");

        assert_eq!(read(&path).expect("read list"), ["alpha", "beta"]);
        let _ = fs::remove_dir_all(&dir);
    }
}
