//! Dependency rewriter: point other device-mapper tables at a
//! multipath device instead of its underlying block devices.
//!
//! Grounded on `devmapper.c`'s `dm_reassign_deps`/`dm_reassign_table`/
//! `dm_reassign`. The original grows the replacement params string in a
//! caller-sized buffer with `strcpy`/`strcat`; this crate instead
//! computes the exact output length and allocates a fresh `String`,
//! removing the buffer-overwrite hazard entirely (see `DESIGN.md`, Open
//! question 1).

use dm_sys::cookie::Cookie;
use dm_sys::ioctl::MPATH_UDEV_RELOAD_FLAG;
use dm_sys::task::{self, Target};

use crate::error::{MapError, MapResult};

const MULTIPATH_TARGET_TYPE: &str = "multipath";

/// Rewrite the first occurrence of `old` (a `major:minor` string) in
/// `params` to `new`, provided it is not immediately followed by
/// another digit (which would mean `old` was actually a prefix of a
/// larger minor number, e.g. matching "8:1" inside "8:12").
///
/// Returns `None` if `old` does not occur under that guard, in which
/// case the caller should keep `params` unchanged.
pub fn rewrite_dependency(params: &str, old: &str, new: &str) -> Option<String> {
    let pos = params.find(old)?;
    let after = pos + old.len();
    if params.as_bytes().get(after).is_some_and(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut out = String::with_capacity(params.len() - old.len() + new.len());
    out.push_str(&params[..pos]);
    out.push_str(new);
    out.push_str(&params[after..]);
    Some(out)
}

/// One target row read back from the live table, for reassignment.
pub struct TableTarget {
    pub start: u64,
    pub length: u64,
    pub target_type: String,
    pub params: String,
}

/// Rewrite every non-multipath target in `name`'s table whose params
/// reference `old` (`major:minor`) to reference `new` instead, then
/// `RELOAD` + `RESUME` the result.
///
/// A target with no type or no params aborts the whole operation: an
/// incomplete enumeration would otherwise be reassembled with a missing
/// row silently dropped, corrupting the table.
pub fn reassign_table(name: &str, targets: &[TableTarget], old: &str, new: &str) -> MapResult<()> {
    if targets.iter().any(|t| t.target_type.is_empty() || t.params.is_empty()) {
        return Err(MapError::MalformedTable(name.to_string()));
    }

    let rewritten: Vec<Target> = targets
        .iter()
        .map(|t| {
            let params = if t.target_type == MULTIPATH_TARGET_TYPE {
                t.params.clone()
            } else {
                rewrite_dependency(&t.params, old, new).unwrap_or_else(|| t.params.clone())
            };
            Target {
                start: t.start,
                length: t.length,
                target_type: t.target_type.clone(),
                params,
            }
        })
        .collect();

    task::table_load(name, &rewritten, 0).map_err(MapError::Dm)?;
    let cookie = Cookie::new().map_err(MapError::Dm)?;
    task::resume(name, 0, Some(cookie.ioctl_value(MPATH_UDEV_RELOAD_FLAG))).map_err(MapError::Dm)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_replaces_first_occurrence() {
        let out = rewrite_dependency("8:0 0", "8:0", "253:5").unwrap();
        assert_eq!(out, "253:5 0");
    }

    #[test]
    fn rewrite_guards_against_longer_minor_prefix() {
        // "8:1" must not match inside "8:12 0"
        assert_eq!(rewrite_dependency("8:12 0", "8:1", "253:5"), None);
    }

    #[test]
    fn rewrite_returns_none_when_absent() {
        assert_eq!(rewrite_dependency("253:2 0", "8:0", "253:5"), None);
    }

    #[test]
    fn reassign_table_rejects_incomplete_enumeration() {
        let targets = vec![TableTarget {
            start: 0,
            length: 100,
            target_type: String::new(),
            params: String::new(),
        }];
        let err = reassign_table("map0", &targets, "8:0", "253:5").unwrap_err();
        assert!(matches!(err, MapError::MalformedTable(_)));
    }
}
