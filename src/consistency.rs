//! Consistency checker: reconciles operator-declared aliases with the
//! on-disk bindings file.
//!
//! Grounded on `alias.c`'s `check_alias_settings`/`_check_bindings_file`:
//! operator entries are inserted into a fresh store first (a conflicting
//! operator entry is dropped outright and reported to the caller so it
//! can null out that entry), then the on-disk file is merged in,
//! rewriting the file if anything had to be dropped.

use std::path::Path;

use log::warn;

use crate::bindings::{BindingStore, InsertResult};
use crate::error::{BindingsError, BindingsResult};

/// An operator-declared alias that conflicted with another operator
/// entry and was dropped. The caller (holder of the original
/// configuration) is expected to null out this alias in its own table,
/// the way `check_alias_settings` does for `mpe->alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedOperatorAlias {
    pub alias: String,
    pub wwid: String,
}

pub struct CheckResult {
    pub store: BindingStore,
    pub dropped_operator_aliases: Vec<DroppedOperatorAlias>,
    pub file_rewritten: bool,
}

/// Reconcile `operator_aliases` (an operator config's `alias -> wwid`
/// table, in the order the operator declared them) against the bindings
/// file at `bindings_path`.
///
/// Returns the validated store plus the operator entries that had to be
/// dropped due to an alias being claimed twice. If the file contained
/// conflicting lines, it is rewritten unless `read_only` is set, in
/// which case an unresolved conflict is an error.
pub fn check_alias_settings(
    bindings_path: &Path,
    operator_aliases: &[(String, String)],
    read_only: bool,
) -> BindingsResult<CheckResult> {
    let mut store = BindingStore::new();
    let mut dropped_operator_aliases = Vec::new();

    // Operator aliases are sorted by alias before insertion, matching
    // `vector_sort(mptable, alias_compar)`, so the first-declared
    // binding for any given alias wins and every conflicting later one
    // is reported.
    let mut sorted: Vec<&(String, String)> = operator_aliases.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    for (alias, wwid) in sorted {
        if let InsertResult::Conflict = store.insert(alias, wwid) {
            warn!("alias {alias:?} bound to multiple wwids in operator config, discarding binding to {wwid:?}");
            dropped_operator_aliases.push(DroppedOperatorAlias {
                alias: alias.clone(),
                wwid: wwid.clone(),
            });
        }
    }

    let mut needs_rewrite = false;
    match std::fs::File::open(bindings_path) {
        Ok(f) => {
            needs_rewrite |= merge_bindings_file(&mut store, f, operator_aliases);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(BindingsError::Io(e)),
    }

    let mut file_rewritten = false;
    if needs_rewrite {
        if read_only {
            return Err(BindingsError::UnresolvedConflicts);
        }
        store.flush(bindings_path)?;
        file_rewritten = true;
    }

    Ok(CheckResult { store, dropped_operator_aliases, file_rewritten })
}

/// Merge the on-disk file's lines into `store`. Returns `true` if any
/// line conflicted (either with an operator alias or within the file
/// itself) and the file should be rewritten.
fn merge_bindings_file(
    store: &mut BindingStore,
    file: std::fs::File,
    operator_aliases: &[(String, String)],
) -> bool {
    use std::io::{BufRead, BufReader};

    let mut needs_rewrite = false;
    let reader = BufReader::new(file);
    for (line_nr, line) in reader.lines().enumerate() {
        let Ok(line) = line else { break };
        let trimmed = line.split(['#', '\n', '\r']).next().unwrap_or("");
        let mut tokens = trimmed.split_whitespace();
        let Some(alias) = tokens.next() else { continue };
        let Some(wwid) = tokens.next() else {
            warn!("invalid line {} in bindings file, missing WWID", line_nr + 1);
            continue;
        };
        if let Some(extra) = tokens.next() {
            warn!("invalid line {} in bindings file, extra args {extra:?}", line_nr + 1);
        }

        if let Some((_, operator_wwid)) = operator_aliases.iter().find(|(a, _)| a == alias) {
            if operator_wwid != wwid {
                warn!(
                    "alias {alias:?} for WWID {wwid} in bindings file on line {} conflicts with operator config entry for {operator_wwid}",
                    line_nr + 1
                );
                needs_rewrite = true;
                continue;
            }
        }

        match store.insert(alias, wwid) {
            InsertResult::Conflict => {
                warn!(
                    "multiple bindings for alias {alias:?} in bindings file on line {}, discarding binding to WWID {wwid:?}",
                    line_nr + 1
                );
                needs_rewrite = true;
            }
            InsertResult::Exists => {}
            InsertResult::Added => {}
        }
    }
    needs_rewrite
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TestTempDir {
        path: std::path::PathBuf,
    }

    impl TestTempDir {
        fn new(name: &str) -> Self {
            let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
            let path = std::env::temp_dir().join(format!(
                "mpath-core-consistency-{}-{}-{}",
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
    fn operator_conflicting_aliases_are_dropped() {
        let dir = TestTempDir::new("operator-conflict");
        let path = dir.path().join("bindings");
        let operator = vec![
            ("mpatha".to_string(), "wwid-1".to_string()),
            ("mpatha".to_string(), "wwid-2".to_string()),
        ];
        let result = check_alias_settings(&path, &operator, false).unwrap();
        assert_eq!(result.dropped_operator_aliases.len(), 1);
        assert_eq!(result.dropped_operator_aliases[0].wwid, "wwid-2");
        assert_eq!(result.store.lookup_by_alias("mpatha"), Some("wwid-1"));
    }

    #[test]
    fn file_conflicting_with_operator_is_rewritten() {
        let dir = TestTempDir::new("file-conflict");
        let path = dir.path().join("bindings");
        fs::write(&path, "mpatha wwid-file\n").unwrap();
        let operator = vec![("mpatha".to_string(), "wwid-operator".to_string())];
        let result = check_alias_settings(&path, &operator, false).unwrap();
        assert!(result.file_rewritten);
        assert_eq!(result.store.lookup_by_alias("mpatha"), Some("wwid-operator"));
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("mpatha wwid-operator"));
        assert!(!contents.contains("wwid-file"));
    }

    #[test]
    fn read_only_with_conflicts_errors_out() {
        let dir = TestTempDir::new("readonly-conflict");
        let path = dir.path().join("bindings");
        fs::write(&path, "mpatha wwid-file\n").unwrap();
        let operator = vec![("mpatha".to_string(), "wwid-operator".to_string())];
        let err = check_alias_settings(&path, &operator, true).unwrap_err();
        assert!(matches!(err, BindingsError::UnresolvedConflicts));
    }

    #[test]
    fn consistent_file_is_not_rewritten() {
        let dir = TestTempDir::new("consistent");
        let path = dir.path().join("bindings");
        fs::write(&path, "mpatha wwid-1\nmpathb wwid-2\n").unwrap();
        let operator = vec![("mpatha".to_string(), "wwid-1".to_string())];
        let result = check_alias_settings(&path, &operator, false).unwrap();
        assert!(!result.file_rewritten);
        assert_eq!(result.store.lookup_by_alias("mpathb"), Some("wwid-2"));
    }
}
