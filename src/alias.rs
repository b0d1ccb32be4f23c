//! Name allocator: turns a WWID into a stable, unique, human-friendly
//! alias such as `mpatha`, `mpathb`, ..., `mpathz`, `mpathaa`, ...
//!
//! Grounded on `alias.c`'s `format_devname`/`scan_devname`/
//! `lookup_binding`/`allocate_binding`/`get_user_friendly_alias`. The
//! gap-filling allocation algorithm (the `id`/`biggest_id`/
//! `smallest_bigger_id` scan) is reproduced verbatim in spirit; see the
//! inline comments in `lookup_binding` for the invariant it relies on.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::{debug, warn};

use crate::bindings::{BindingStore, WWID_SIZE};
use crate::error::{BindingsError, BindingsResult};

/// Longest base-26 encoding this allocator will produce: an 8-letter
/// encoding would overflow `i32`, so 7 letters is the ceiling.
const MAX_DEVNAME_LETTERS: usize = 7;

/// Something that can tell whether an alias is already claimed by a
/// live device bound to a different WWID. In production this is backed
/// by the device-mapper control surface (`dm_map_present` +
/// `dm_get_uuid`); tests supply a fake so the allocator's logic can be
/// verified without root or a real `/dev/mapper/control`.
pub trait AliasCollisionChecker {
    /// Returns `true` if a live device named `alias` exists whose WWID
    /// differs from `wwid` (i.e. the alias is unavailable for `wwid`).
    fn alias_taken(&self, alias: &str, wwid: &str) -> bool;
}

/// A checker that reports no collisions; useful when the caller already
/// knows the kernel namespace is empty, or in tests.
pub struct NoCollisions;

impl AliasCollisionChecker for NoCollisions {
    fn alias_taken(&self, _alias: &str, _wwid: &str) -> bool {
        false
    }
}

/// Encode a positive integer as a base-26 string over `a..z`, with no
/// leading `a` on multi-letter outputs (1 -> "a", 26 -> "z", 27 -> "aa",
/// 52 -> "az", 53 -> "ba").
pub fn format_devname(id: i32) -> Option<String> {
    if id <= 0 {
        return None;
    }
    let mut id = id;
    let mut letters = Vec::with_capacity(MAX_DEVNAME_LETTERS);
    while id >= 1 {
        let rem = (id - 1) % 26;
        letters.push(b'a' + rem as u8);
        id = (id - 1) / 26;
    }
    letters.reverse();
    Some(String::from_utf8(letters).unwrap())
}

/// Inverse of `format_devname`: given `<prefix><devname>`, return the
/// encoded integer, or `None` if `alias` doesn't match `prefix` followed
/// by a valid lowercase-letter devname (bounded to 7 letters so the
/// result fits in `i32`).
pub fn scan_devname(alias: &str, prefix: &str) -> Option<i32> {
    let rest = alias.strip_prefix(prefix)?;
    if rest.is_empty() || rest.len() > MAX_DEVNAME_LETTERS {
        return None;
    }
    let mut n: i64 = 0;
    for c in rest.chars() {
        if !c.is_ascii_lowercase() {
            return None;
        }
        let i = (c as u8 - b'a') as i64;
        n = n * 26 + i + 1;
        if n > i32::MAX as i64 {
            return None;
        }
    }
    Some(n as i32)
}

enum Lookup {
    /// An existing binding for this WWID was found.
    Found(String),
    /// No existing binding; this ID is available to allocate.
    Free(i32),
    /// The ID space is exhausted.
    Exhausted,
}

/// Scan `store` for a binding matching `wwid`; if none is found,
/// compute the lowest unused devname ID under `prefix`.
///
/// Implements the gap-filling search: `id` tracks the next *expected*
/// ID in an in-order walk (all IDs below it are known used); whenever an
/// out-of-order ID larger than the current `id` is seen,
/// `smallest_bigger_id` records the smallest such value. At the end,
/// `id < smallest_bigger_id` means `id` itself was never used by
/// anything, so it's free; otherwise the safe choice is
/// `biggest_id + 1`.
fn lookup_binding(
    store: &BindingStore,
    wwid: &str,
    prefix: Option<&str>,
    check_if_taken: bool,
    checker: &dyn AliasCollisionChecker,
) -> Lookup {
    let mut id: i64 = 1;
    let mut biggest_id: i64 = 1;
    let mut smallest_bigger_id: i64 = i32::MAX as i64;

    for b in store.iter() {
        if b.wwid == wwid {
            debug!("found matching wwid {wwid:?} in bindings file, alias {:?}", b.alias);
            return Lookup::Found(b.alias.clone());
        }
        let Some(prefix) = prefix else { continue };
        let Some(curr_id) = scan_devname(&b.alias, prefix) else { continue };
        let curr_id = curr_id as i64;
        if curr_id == id {
            id += 1;
        }
        if curr_id > biggest_id {
            biggest_id = curr_id;
        }
        if curr_id > id && curr_id < smallest_bigger_id {
            smallest_bigger_id = curr_id;
        }
    }

    if prefix.is_none() && check_if_taken {
        return Lookup::Exhausted;
    }
    let Some(prefix) = prefix else {
        return Lookup::Exhausted;
    };

    if id >= smallest_bigger_id {
        if biggest_id < i32::MAX as i64 {
            id = biggest_id + 1;
        } else {
            return Lookup::Exhausted;
        }
    }

    if check_if_taken {
        loop {
            let Some(candidate) = format_devname(id as i32) else {
                return Lookup::Exhausted;
            };
            let candidate_alias = format!("{prefix}{candidate}");
            if !checker.alias_taken(&candidate_alias, wwid) {
                break;
            }
            debug!("alias {candidate_alias:?} already taken, reselecting");
            if id == i32::MAX as i64 {
                return Lookup::Exhausted;
            }
            id += 1;
            if id == smallest_bigger_id {
                if biggest_id == i32::MAX as i64 {
                    return Lookup::Exhausted;
                }
                if biggest_id >= smallest_bigger_id {
                    id = biggest_id + 1;
                }
            }
        }
    }

    Lookup::Free(id as i32)
}

/// Append `<prefix><devname(id)> <wwid>\n` to the open bindings file,
/// rolling back to the pre-append length on a short or failed write.
fn allocate_binding(file: &mut File, wwid: &str, id: i32, prefix: &str) -> BindingsResult<String> {
    let devname = format_devname(id).ok_or(BindingsError::IdSpaceExhausted)?;
    let alias = format!("{prefix}{devname}");
    let line = format!("{alias} {wwid}\n");

    let offset = file.seek(SeekFrom::End(0))?;
    if let Err(e) = file.write_all(line.as_bytes()) {
        let _ = file.set_len(offset);
        return Err(BindingsError::Io(e));
    }
    debug!("created new binding [{alias}] for WWID [{wwid}]");
    Ok(alias)
}

/// Return the friendly alias for `wwid`, allocating and persisting a
/// new one if necessary.
///
/// `preferred_alias` (the device's previously-known alias, if any) is
/// reused when it is either already bound to `wwid`, or unbound and
/// parses as `<prefix><devname>` with no collision. Otherwise a fresh
/// alias is allocated via `lookup_binding`.
pub fn get_friendly_alias(
    bindings_path: &Path,
    wwid: &str,
    preferred_alias: Option<&str>,
    prefix: &str,
    read_only: bool,
    checker: &dyn AliasCollisionChecker,
) -> BindingsResult<String> {
    if wwid.is_empty() || wwid.len() > WWID_SIZE - 1 {
        return Err(BindingsError::InvalidAlias(wwid.to_string()));
    }

    let can_write = !read_only;
    let store = BindingStore::load_file(bindings_path)?;

    if let Some(preferred) = preferred_alias.filter(|a| !a.is_empty()) {
        if let Some(bound_wwid) = store.lookup_by_alias(preferred) {
            if bound_wwid == wwid {
                return Ok(preferred.to_string());
            }
            warn!("alias {preferred:?} already bound to wwid {bound_wwid:?}, cannot reuse");
        } else {
            // Not found in the bindings file: is it a winning existing
            // binding for our WWID under a neutral lookup, or a fresh id
            // we can claim outright?
            match lookup_binding(&store, wwid, None, false, checker) {
                Lookup::Found(alias) => {
                    if !checker.alias_taken(&alias, wwid) {
                        debug!("using existing binding [{alias}] for WWID [{wwid}]");
                        return Ok(alias);
                    }
                }
                _ => {
                    if let Some(id) = scan_devname(preferred, prefix) {
                        if !checker.alias_taken(preferred, wwid) {
                            return finish_allocation(bindings_path, wwid, id, prefix, can_write);
                        }
                        warn!(
                            "preferred alias {preferred:?} collides with a live kernel device, falling back to allocation"
                        );
                    }
                }
            }
        }
    } else if let Lookup::Found(alias) = lookup_binding(&store, wwid, None, false, checker) {
        if !checker.alias_taken(&alias, wwid) {
            debug!("using existing binding [{alias}] for WWID [{wwid}]");
            return Ok(alias);
        }
    }

    match lookup_binding(&store, wwid, Some(prefix), true, checker) {
        Lookup::Found(alias) => Ok(alias),
        Lookup::Free(id) => finish_allocation(bindings_path, wwid, id, prefix, can_write),
        Lookup::Exhausted => Err(BindingsError::IdSpaceExhausted),
    }
}

fn finish_allocation(
    bindings_path: &Path,
    wwid: &str,
    id: i32,
    prefix: &str,
    can_write: bool,
) -> BindingsResult<String> {
    let devname = format_devname(id).ok_or(BindingsError::IdSpaceExhausted)?;
    let alias = format!("{prefix}{devname}");
    if !can_write {
        return Ok(alias);
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .open(bindings_path)?;
    allocate_binding(&mut file, wwid, id, prefix)
}

/// Reverse lookup: the WWID bound to `alias`, if any.
pub fn get_wwid_for(bindings_path: &Path, alias: &str) -> BindingsResult<Option<String>> {
    if alias.is_empty() {
        return Ok(None);
    }
    let store = BindingStore::load_file(bindings_path)?;
    Ok(store.lookup_by_alias(alias).map(|s| s.to_string()))
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
                "mpath-core-alias-{}-{}-{}",
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
    fn format_devname_matches_known_values() {
        assert_eq!(format_devname(1).as_deref(), Some("a"));
        assert_eq!(format_devname(26).as_deref(), Some("z"));
        assert_eq!(format_devname(27).as_deref(), Some("aa"));
        assert_eq!(format_devname(52).as_deref(), Some("az"));
        assert_eq!(format_devname(53).as_deref(), Some("ba"));
        assert_eq!(format_devname(0), None);
        assert_eq!(format_devname(-1), None);
    }

    #[test]
    fn scan_devname_is_inverse_of_format_devname() {
        for id in [1, 2, 25, 26, 27, 51, 52, 53, 700, 18278] {
            let name = format_devname(id).unwrap();
            let alias = format!("mpath{name}");
            assert_eq!(scan_devname(&alias, "mpath"), Some(id));
        }
    }

    #[test]
    fn scan_devname_rejects_wrong_prefix_and_bad_chars() {
        assert_eq!(scan_devname("mpatha", "other"), None);
        assert_eq!(scan_devname("mpath", "mpath"), None);
        assert_eq!(scan_devname("mpathA", "mpath"), None);
        assert_eq!(scan_devname("mpath1", "mpath"), None);
    }

    struct FakeKernel {
        taken: Vec<(&'static str, &'static str)>,
    }

    impl AliasCollisionChecker for FakeKernel {
        fn alias_taken(&self, alias: &str, wwid: &str) -> bool {
            self.taken.iter().any(|(a, w)| *a == alias && *w != wwid)
        }
    }

    #[test]
    fn first_allocation_picks_a() {
        let dir = TestTempDir::new("first");
        let path = dir.path().join("bindings");
        let alias = get_friendly_alias(&path, "wwid-1", None, "mpath", false, &NoCollisions).unwrap();
        assert_eq!(alias, "mpatha");
        let alias_again = get_friendly_alias(&path, "wwid-1", None, "mpath", false, &NoCollisions).unwrap();
        assert_eq!(alias_again, "mpatha");
    }

    #[test]
    fn sparse_gap_is_reused() {
        let dir = TestTempDir::new("sparse");
        let path = dir.path().join("bindings");
        fs::write(&path, "mpatha wwid-a\nmpathc wwid-c\n").unwrap();
        let alias = get_friendly_alias(&path, "wwid-new", None, "mpath", false, &NoCollisions).unwrap();
        assert_eq!(alias, "mpathb");
    }

    #[test]
    fn overflow_past_biggest_when_no_gap() {
        let dir = TestTempDir::new("nogap");
        let path = dir.path().join("bindings");
        fs::write(&path, "mpatha wwid-a\nmpathb wwid-b\n").unwrap();
        let alias = get_friendly_alias(&path, "wwid-new", None, "mpath", false, &NoCollisions).unwrap();
        assert_eq!(alias, "mpathc");
    }

    #[test]
    fn kernel_collision_forces_retry() {
        let dir = TestTempDir::new("collision");
        let path = dir.path().join("bindings");
        let kernel = FakeKernel { taken: vec![("mpatha", "someone-else")] };
        let alias = get_friendly_alias(&path, "wwid-new", None, "mpath", false, &kernel).unwrap();
        assert_eq!(alias, "mpathb");
    }

    #[test]
    fn preferred_alias_reused_when_bound_to_same_wwid() {
        let dir = TestTempDir::new("preferred-same");
        let path = dir.path().join("bindings");
        fs::write(&path, "mpathx wwid-1\n").unwrap();
        let alias = get_friendly_alias(&path, "wwid-1", Some("mpathx"), "mpath", false, &NoCollisions).unwrap();
        assert_eq!(alias, "mpathx");
    }

    #[test]
    fn preferred_alias_rejected_when_bound_to_other_wwid() {
        let dir = TestTempDir::new("preferred-conflict");
        let path = dir.path().join("bindings");
        fs::write(&path, "mpathx wwid-other\n").unwrap();
        let alias = get_friendly_alias(&path, "wwid-1", Some("mpathx"), "mpath", false, &NoCollisions).unwrap();
        assert_ne!(alias, "mpathx");
    }

    #[test]
    fn read_only_does_not_persist_new_binding() {
        let dir = TestTempDir::new("readonly");
        let path = dir.path().join("bindings");
        let alias = get_friendly_alias(&path, "wwid-1", None, "mpath", true, &NoCollisions).unwrap();
        assert_eq!(alias, "mpatha");
        assert!(!path.exists());
    }
}
