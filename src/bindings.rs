//! Persistent alias ↔ WWID bindings store.
//!
//! Grounded on `alias.c`'s `add_binding`/`write_bindings_file`/
//! `update_bindings_file`/`_check_bindings_file`: an in-memory vector
//! kept sorted by alias, backed by a line-oriented text file that is
//! always rewritten atomically.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use log::{debug, warn};

use crate::error::{BindingsError, BindingsResult};

pub const WWID_SIZE: usize = 128;
const LINE_MAX: usize = 4096;

pub const BINDINGS_FILE_HEADER: &str = "\
# Multipath bindings, Version : 1.0
# NOTE: this file is automatically maintained by the multipath program.
# You should not need to edit this file in normal circumstances.
#
# Format:
# alias wwid
#
";

/// A single `alias wwid` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub alias: String,
    pub wwid: String,
}

/// Result of inserting a binding. There is no `Error` variant here: a
/// Rust `Vec` push cannot fail the way the original's heap-allocated
/// `struct binding` could, so the degenerate case the C enum modeled
/// (`BINDING_ERROR` from a failed `calloc`/`strdup`) has no counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Added,
    Exists,
    Conflict,
}

/// In-memory view of the bindings file, kept sorted ascending by alias.
#[derive(Debug, Default)]
pub struct BindingStore {
    bindings: Vec<Binding>,
}

impl BindingStore {
    pub fn new() -> Self {
        BindingStore { bindings: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn lookup_by_wwid(&self, wwid: &str) -> Option<&str> {
        self.bindings.iter().find(|b| b.wwid == wwid).map(|b| b.alias.as_str())
    }

    pub fn lookup_by_alias(&self, alias: &str) -> Option<&str> {
        // Store is sorted, but exact lookup doesn't need the sort; a
        // linear scan matches the original's rlookup_binding, which
        // reads the raw file front-to-back rather than indexing the
        // parsed vector.
        self.bindings.iter().find(|b| b.alias == alias).map(|b| b.wwid.as_str())
    }

    /// Insert a binding, keeping the vector sorted ascending by alias.
    /// Searches backwards under the assumption that the file (and thus
    /// the insert sequence during load) is already close to sorted.
    pub fn insert(&mut self, alias: &str, wwid: &str) -> InsertResult {
        let mut pos = self.bindings.len();
        let mut exact: Option<usize> = None;
        for i in (0..self.bindings.len()).rev() {
            match self.bindings[i].alias.as_str().cmp(alias) {
                std::cmp::Ordering::Equal => {
                    exact = Some(i);
                    pos = i;
                    break;
                }
                std::cmp::Ordering::Less => {
                    pos = i + 1;
                    break;
                }
                std::cmp::Ordering::Greater => {
                    pos = i;
                }
            }
        }

        if let Some(i) = exact {
            return if self.bindings[i].wwid == wwid {
                InsertResult::Exists
            } else {
                InsertResult::Conflict
            };
        }

        self.bindings.insert(
            pos,
            Binding { alias: alias.to_string(), wwid: wwid.to_string() },
        );
        InsertResult::Added
    }

    pub fn reset(&mut self) {
        self.bindings.clear();
    }

    /// Parse bindings out of `reader` and add each line via `insert`,
    /// logging the same way `_check_bindings_file` does: missing-WWID
    /// lines are dropped with a warning; extra fields are accepted with
    /// a warning; conflicting/duplicate aliases are logged and dropped
    /// from insertion (the first-seen binding wins).
    pub fn load<R: Read>(&mut self, reader: R) {
        let mut buf = BufReader::new(reader);
        let mut line_nr: u32 = 0;
        let mut line = String::new();
        loop {
            line.clear();
            let n = match buf.read_line(&mut line) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("error reading bindings file: {e}");
                    break;
                }
            };
            let _ = n;
            line_nr += 1;
            if line.len() > LINE_MAX {
                warn!("ignoring overlong line {line_nr} in bindings file");
                continue;
            }
            let trimmed = line
                .split(['#', '\n', '\r'])
                .next()
                .unwrap_or("");
            let mut tokens = trimmed.split_whitespace();
            let Some(alias) = tokens.next() else { continue };
            let Some(wwid) = tokens.next() else {
                warn!("ignoring malformed line {line_nr} in bindings file");
                continue;
            };
            if let Some(extra) = tokens.next() {
                warn!("invalid line {line_nr} in bindings file, extra args {extra:?}");
            }
            if wwid.len() > WWID_SIZE - 1 {
                warn!("ignoring too-large wwid at line {line_nr} in bindings file");
                continue;
            }
            match self.insert(alias, wwid) {
                InsertResult::Added => {}
                InsertResult::Exists => {
                    debug!("duplicate line for alias {alias} in bindings file at line {line_nr}");
                }
                InsertResult::Conflict => {
                    warn!(
                        "multiple bindings for alias {alias:?} in bindings file at line {line_nr}, discarding binding to WWID {wwid:?}"
                    );
                }
            }
        }
    }

    /// Load directly from a file path; a missing file yields an empty
    /// store rather than an error (mirrors `open_file`'s create-if-absent
    /// contract at the caller layer).
    pub fn load_file(path: &Path) -> BindingsResult<Self> {
        let mut store = BindingStore::new();
        match File::open(path) {
            Ok(f) => store.load(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BindingsError::Io(e)),
        }
        Ok(store)
    }

    /// Serialize the header plus every binding into `writer`.
    fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(BINDINGS_FILE_HEADER.as_bytes())?;
        for b in &self.bindings {
            writeln!(writer, "{} {}", b.alias, b.wwid)?;
        }
        Ok(())
    }

    /// Atomically rewrite `path`: write to `<path>.XXXXXX` in the same
    /// directory at mode 0600, then rename over the target. A failed
    /// write removes the temporary file rather than leaving it behind.
    pub fn flush(&self, path: &Path) -> BindingsResult<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("bindings");
        let tmp_path = unique_temp_path(dir, file_name);

        let result = (|| -> std::io::Result<()> {
            let mut f = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&tmp_path)?;
            self.write_to(&mut f)?;
            f.flush()?;
            fs::rename(&tmp_path, path)?;
            Ok(())
        })();

        if let Err(e) = &result {
            let _ = fs::remove_file(&tmp_path);
            warn!("failed to update bindings file {}: {e}", path.display());
        }
        result.map_err(BindingsError::Io)
    }
}

fn unique_temp_path(dir: &Path, base: &str) -> std::path::PathBuf {
    let pid = std::process::id();
    // A monotonically increasing counter disambiguates multiple
    // temp-file creations within the same process/pid tick.
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("{base}.{pid}{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TestTempDir {
        path: std::path::PathBuf,
    }

    impl TestTempDir {
        fn new(name: &str) -> Self {
            let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
            let path = std::env::temp_dir().join(format!(
                "mpath-core-bindings-{}-{}-{}",
                std::process::id(),
                name,
                ts
            ));
            fs::create_dir_all(&path).unwrap();
            Self { path }
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for TestTempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let mut store = BindingStore::new();
        assert_eq!(store.insert("mpathc", "wwid-c"), InsertResult::Added);
        assert_eq!(store.insert("mpatha", "wwid-a"), InsertResult::Added);
        assert_eq!(store.insert("mpathb", "wwid-b"), InsertResult::Added);
        let aliases: Vec<_> = store.iter().map(|b| b.alias.as_str()).collect();
        assert_eq!(aliases, vec!["mpatha", "mpathb", "mpathc"]);
    }

    #[test]
    fn insert_detects_exists_and_conflict() {
        let mut store = BindingStore::new();
        assert_eq!(store.insert("mpatha", "wwid-a"), InsertResult::Added);
        assert_eq!(store.insert("mpatha", "wwid-a"), InsertResult::Exists);
        assert_eq!(store.insert("mpatha", "wwid-x"), InsertResult::Conflict);
    }

    #[test]
    fn load_parses_lines_and_skips_malformed() {
        let mut store = BindingStore::new();
        let data = b"# comment\nmpatha wwid-a\nmpathb\nmpathc wwid-c extra ignored\n\nmpathd wwid-d # trailing\n";
        store.load(&data[..]);
        assert_eq!(store.lookup_by_wwid("wwid-a"), Some("mpatha"));
        assert_eq!(store.lookup_by_alias("mpathb"), None);
        assert_eq!(store.lookup_by_wwid("wwid-c"), Some("mpathc"));
        assert_eq!(store.lookup_by_wwid("wwid-d"), Some("mpathd"));
    }

    #[test]
    fn flush_then_load_round_trips() {
        let dir = TestTempDir::new("flush");
        let path = dir.path().join("bindings");
        let mut store = BindingStore::new();
        store.insert("mpatha", "wwid-a");
        store.insert("mpathb", "wwid-b");
        store.flush(&path).unwrap();

        let loaded = BindingStore::load_file(&path).unwrap();
        assert_eq!(loaded.lookup_by_wwid("wwid-a"), Some("mpatha"));
        assert_eq!(loaded.lookup_by_wwid("wwid-b"), Some("mpathb"));

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(BINDINGS_FILE_HEADER));
    }

    #[test]
    fn flush_sets_mode_0600() {
        let dir = TestTempDir::new("mode");
        let path = dir.path().join("bindings");
        let store = BindingStore::new();
        store.flush(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn load_missing_file_yields_empty_store() {
        let dir = TestTempDir::new("missing");
        let path = dir.path().join("does-not-exist");
        let store = BindingStore::load_file(&path).unwrap();
        assert!(store.is_empty());
    }
}
