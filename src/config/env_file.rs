//! `.env` file loader
//!
//! Reads `KEY=VALUE` lines into an [`EnvStore`]. Keys that are already set are
//! left alone unless the caller asks for an override.

use crate::error::{IoResultExt, OpsError, Result};
use crate::output::Tabular;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;

/// One parsed assignment from an environment file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    /// Variable name
    pub key: String,
    /// Value with quotes removed and escapes applied
    pub value: String,
    /// 1-based line number in the source
    pub line: usize,
}

/// Destination for loaded variables
pub trait EnvStore {
    /// Current value of a variable
    fn get(&self, key: &str) -> Option<String>;
    /// Assign a variable
    fn set(&mut self, key: &str, value: &str);
}

/// The real process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvStore for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var_os(key).map(|v| v.to_string_lossy().into_owned())
    }

    fn set(&mut self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }
}

impl EnvStore for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.insert(key.to_string(), value.to_string());
    }
}

/// Outcome of loading a file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Keys written to the store
    pub set: Vec<String>,
    /// Keys left untouched because they were already present
    pub skipped: Vec<String>,
}

/// Parse the contents of an environment file
pub fn parse_env(contents: &str) -> Result<Vec<EnvEntry>> {
    let mut entries = Vec::new();

    for (idx, raw) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

        let (key, value) = line.split_once('=').ok_or_else(|| OpsError::EnvFile {
            line: line_no,
            message: "expected KEY=VALUE".to_string(),
        })?;

        let key = key.trim();
        if !is_valid_key(key) {
            return Err(OpsError::EnvFile {
                line: line_no,
                message: format!("invalid variable name '{}'", key),
            });
        }

        let value = parse_value(value.trim()).map_err(|message| OpsError::EnvFile {
            line: line_no,
            message,
        })?;

        entries.push(EnvEntry {
            key: key.to_string(),
            value,
            line: line_no,
        });
    }

    Ok(entries)
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn parse_value(value: &str) -> std::result::Result<String, String> {
    if let Some(rest) = value.strip_prefix('"') {
        let inner = rest
            .strip_suffix('"')
            .ok_or_else(|| "unterminated double quote".to_string())?;
        return Ok(unescape(inner));
    }

    if let Some(rest) = value.strip_prefix('\'') {
        let inner = rest
            .strip_suffix('\'')
            .ok_or_else(|| "unterminated single quote".to_string())?;
        return Ok(inner.to_string());
    }

    // Unquoted: a " #" starts an inline comment
    let value = match value.find(" #") {
        Some(pos) => value[..pos].trim_end(),
        None => value,
    };
    Ok(value.to_string())
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Keys only; values never leave the loader
impl Tabular for LoadReport {
    fn columns(&self) -> Vec<String> {
        vec!["key".into(), "status".into()]
    }

    fn rows(&self) -> Vec<Vec<Value>> {
        self.set
            .iter()
            .map(|k| vec![json!(k), json!("set")])
            .chain(self.skipped.iter().map(|k| vec![json!(k), json!("kept")]))
            .collect()
    }
}

/// Snapshot of the process environment, for planning a load without applying it
pub fn process_env_snapshot() -> HashMap<String, String> {
    std::env::vars_os()
        .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
        .collect()
}

/// Apply parsed entries to a store
pub fn apply_env<S: EnvStore + ?Sized>(
    entries: &[EnvEntry],
    store: &mut S,
    override_existing: bool,
) -> LoadReport {
    let mut report = LoadReport::default();

    for entry in entries {
        if !override_existing && store.get(&entry.key).is_some() {
            tracing::debug!("Keeping existing value for {}", entry.key);
            report.skipped.push(entry.key.clone());
            continue;
        }
        store.set(&entry.key, &entry.value);
        report.set.push(entry.key.clone());
    }

    report
}

/// Read a file from disk and apply it to a store
pub fn load_env_file<S: EnvStore + ?Sized>(
    path: &Path,
    store: &mut S,
    override_existing: bool,
) -> Result<LoadReport> {
    let contents = std::fs::read_to_string(path).with_path(path)?;
    let entries = parse_env(&contents)
        .map_err(|e| e.with_context(format!("parsing {}", path.display())))?;
    let report = apply_env(&entries, store, override_existing);

    tracing::info!(
        "Loaded {} variable(s) from {} ({} already set)",
        report.set.len(),
        path.display(),
        report.skipped.len()
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{render_to_string, OutputFormat};
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_report_lists_keys_without_values() {
        let entries = parse_env("TOKEN=s3cret\nREGION=westeurope\n").unwrap();
        let mut store: HashMap<String, String> = HashMap::new();
        store.insert("REGION".into(), "northeurope".into());
        let report = apply_env(&entries, &mut store, false);
        let text = render_to_string(OutputFormat::Csv, &report);
        assert!(text.contains("TOKEN,set"));
        assert!(text.contains("REGION,kept"));
        assert!(!text.contains("s3cret"));
    }

    #[test]
    fn test_parse_basic_lines() {
        let entries = parse_env("A=1\n# comment\n\nexport B = two words \n").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "A");
        assert_eq!(entries[0].value, "1");
        assert_eq!(entries[1].key, "B");
        assert_eq!(entries[1].value, "two words");
        assert_eq!(entries[1].line, 4);
    }

    #[test]
    fn test_quotes_stripped() {
        let entries = parse_env("KEY=\"a b\"\nSINGLE='x \\n y'\nESC=\"l1\\nl2\"").unwrap();
        assert_eq!(entries[0].value, "a b");
        assert_eq!(entries[1].value, "x \\n y");
        assert_eq!(entries[2].value, "l1\nl2");
    }

    #[test]
    fn test_inline_comment_only_unquoted() {
        let entries = parse_env("A=value # note\nB=\"keep # this\"").unwrap();
        assert_eq!(entries[0].value, "value");
        assert_eq!(entries[1].value, "keep # this");
    }

    #[test]
    fn test_invalid_lines_report_line_number() {
        match parse_env("A=1\nnot a pair\n") {
            Err(OpsError::EnvFile { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(parse_env("1BAD=x").is_err());
        assert!(parse_env("A=\"open").is_err());
    }

    #[test]
    fn test_existing_keys_skipped_without_override() {
        let entries = parse_env("A=new\nB=b").unwrap();
        let mut store: HashMap<String, String> = HashMap::new();
        store.insert("A".into(), "old".into());

        let report = apply_env(&entries, &mut store, false);
        assert_eq!(store["A"], "old");
        assert_eq!(store["B"], "b");
        assert_eq!(report.skipped, vec!["A".to_string()]);

        let report = apply_env(&entries, &mut store, true);
        assert_eq!(store["A"], "new");
        assert_eq!(report.set.len(), 2);
    }

    #[test]
    fn test_comments_and_blanks_do_not_mutate() {
        let entries = parse_env("# A=1\n\n   \n  # B=2").unwrap();
        let mut store: HashMap<String, String> = HashMap::new();
        let report = apply_env(&entries, &mut store, true);
        assert!(store.is_empty());
        assert!(report.set.is_empty());
    }

    #[test]
    fn test_load_env_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "DB_HOST=localhost").unwrap();
        writeln!(file, "DB_PASS=\"s3cr3t value\"").unwrap();

        let mut store: HashMap<String, String> = HashMap::new();
        let report = load_env_file(file.path(), &mut store, false).unwrap();
        assert_eq!(report.set, vec!["DB_HOST".to_string(), "DB_PASS".to_string()]);
        assert_eq!(store["DB_PASS"], "s3cr3t value");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let mut store: HashMap<String, String> = HashMap::new();
        let err = load_env_file(Path::new("/nonexistent/.env"), &mut store, false).unwrap_err();
        assert!(matches!(err, OpsError::Io { .. }));
    }

    proptest! {
        #[test]
        fn prop_valid_lines_set_keys(
            pairs in proptest::collection::btree_map("[A-Z_][A-Z0-9_]{0,12}", "[a-z0-9]{0,12}", 0..16)
        ) {
            let contents: String = pairs
                .iter()
                .map(|(k, v)| format!("{}={}\n", k, v))
                .collect();
            let entries = parse_env(&contents).unwrap();
            let mut store: HashMap<String, String> = HashMap::new();
            apply_env(&entries, &mut store, false);
            for (k, v) in &pairs {
                prop_assert_eq!(store.get(k), Some(v));
            }
        }

        #[test]
        fn prop_quoted_values_unwrapped(value in "[a-z ]{0,20}") {
            let entries = parse_env(&format!("KEY=\"{}\"", value)).unwrap();
            prop_assert_eq!(&entries[0].value, &value);
        }
    }
}
