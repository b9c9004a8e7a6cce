//! Path normalization shared by the scanner, the stores, and the size cache.
//!
//! Every path stored in the index goes through [`normalize_path`] so lookups by
//! path agree with what the scanner wrote: forward slashes, no duplicate or
//! trailing separators, and on macOS the Data-volume firmlink prefix
//! (`/System/Volumes/Data/Users/foo`) mapped back to its canonical path (`/Users/foo`).

use std::sync::LazyLock;

const FIRMLINKS_PATH: &str = "/usr/share/firmlinks";
const DATA_VOLUME_PREFIX: &str = "/System/Volumes/Data/";

/// Firmlink prefix pairs: `(data_volume_prefix, canonical_prefix)`, longest first.
static FIRMLINK_MAP: LazyLock<Vec<(String, String)>> = LazyLock::new(load_firmlinks);

/// Parse `/usr/share/firmlinks` (`{root_path}\t{relative_path}` per line).
///
/// Returns an empty vec if the file doesn't exist (anything but macOS).
fn load_firmlinks() -> Vec<(String, String)> {
    let content = match std::fs::read_to_string(FIRMLINKS_PATH) {
        Ok(c) => c,
        Err(e) => {
            log::debug!("Could not read {FIRMLINKS_PATH}: {e}");
            return Vec::new();
        }
    };
    parse_firmlinks(&content)
}

fn parse_firmlinks(content: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = content
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(2, '\t');
            let root_path = parts.next()?.trim();
            let relative = parts.next()?.trim();
            if root_path.is_empty() || relative.is_empty() {
                return None;
            }
            Some((format!("{DATA_VOLUME_PREFIX}{relative}"), root_path.to_string()))
        })
        .collect();
    pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    pairs
}

/// Normalize a path for storage and lookup.
///
/// - `\` becomes `/`
/// - repeated separators collapse, `.` components drop
/// - trailing separators are removed (except for the bare root `/`)
/// - firmlinked Data-volume prefixes are replaced by their canonical path
pub fn normalize_path(path: &str) -> String {
    let cleaned = clean_separators(path);
    apply_firmlinks(&cleaned, &FIRMLINK_MAP)
}

fn clean_separators(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let parts: Vec<&str> = unified.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

fn apply_firmlinks(path: &str, map: &[(String, String)]) -> String {
    if !path.starts_with(DATA_VOLUME_PREFIX) {
        return path.to_string();
    }
    for (data_prefix, canonical_prefix) in map {
        if let Some(suffix) = path.strip_prefix(data_prefix.as_str())
            && (suffix.is_empty() || suffix.starts_with('/'))
        {
            return format!("{canonical_prefix}{suffix}");
        }
    }
    path.to_string()
}

/// Parent of a normalized path, or `None` for the volume root itself.
///
/// Examples (root `/vol`):
/// - `/vol/a/b.txt` -> `Some("/vol/a")`
/// - `/vol/a` -> `Some("/vol")`
/// - `/vol` -> `None`
pub fn parent_path(path: &str, volume_root: &str) -> Option<String> {
    if path == volume_root {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(pos) => Some(path[..pos].to_string()),
        None => None,
    }
}

/// Number of components between the volume root and `path` (root = 0).
pub fn depth_from_root(path: &str, volume_root: &str) -> u32 {
    let Some(rest) = path.strip_prefix(volume_root) else {
        return 0;
    };
    rest.split('/').filter(|p| !p.is_empty()).count() as u32
}

/// Whether `path` equals `dir` or lives below it.
pub fn is_same_or_child(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path.starts_with('/');
    }
    path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

/// Simple type tag: `directory`, the lowercase extension, or `file`.
pub fn kind_tag(name: &str, is_directory: bool) -> String {
    if is_directory {
        return "directory".to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_lowercase(),
        _ => "file".to_string(),
    }
}

/// Half-open key range `[lower, upper)` covering everything strictly below `dir`.
///
/// Used instead of `LIKE` (which is case-insensitive for ASCII in SQLite and
/// treats `_`/`%` in names as wildcards). `0` is the byte right after `/`.
pub fn descendants_range(dir: &str) -> (String, String) {
    if dir == "/" {
        ("/".to_string(), "0".to_string())
    } else {
        (format!("{dir}/"), format!("{dir}0"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_separators_cases() {
        assert_eq!(clean_separators("/a//b/./c/"), "/a/b/c");
        assert_eq!(clean_separators("/"), "/");
        assert_eq!(clean_separators("C:\\Users\\me\\"), "C:/Users/me");
        assert_eq!(clean_separators("A/b.txt"), "A/b.txt");
        assert_eq!(clean_separators(""), ".");
    }

    #[test]
    fn firmlinks_map_to_canonical_paths() {
        let map = parse_firmlinks("/Users\tUsers\n/Applications\tApplications\n\n/usr/local\tusr/local\n");
        assert_eq!(apply_firmlinks("/System/Volumes/Data/Users/foo", &map), "/Users/foo");
        assert_eq!(apply_firmlinks("/System/Volumes/Data/usr/local/bin", &map), "/usr/local/bin");
        assert_eq!(apply_firmlinks("/System/Volumes/Data/Usersfoo", &map), "/System/Volumes/Data/Usersfoo");
        assert_eq!(apply_firmlinks("/tmp/x", &map), "/tmp/x");
    }

    #[test]
    fn parent_path_cases() {
        assert_eq!(parent_path("/vol/a/b.txt", "/vol").as_deref(), Some("/vol/a"));
        assert_eq!(parent_path("/vol/a", "/vol").as_deref(), Some("/vol"));
        assert_eq!(parent_path("/vol", "/vol"), None);
        assert_eq!(parent_path("/a", "/").as_deref(), Some("/"));
        assert_eq!(parent_path("A/b.txt", "A").as_deref(), Some("A"));
    }

    #[test]
    fn depth_cases() {
        assert_eq!(depth_from_root("/vol", "/vol"), 0);
        assert_eq!(depth_from_root("/vol/a", "/vol"), 1);
        assert_eq!(depth_from_root("/vol/a/b/c", "/vol"), 3);
        assert_eq!(depth_from_root("/a/b", "/"), 2);
    }

    #[test]
    fn child_checks() {
        assert!(is_same_or_child("/Users/foo", "/Users/foo"));
        assert!(is_same_or_child("/Users/foo/bar", "/Users/foo"));
        assert!(!is_same_or_child("/Users/foobar", "/Users/foo"));
        assert!(!is_same_or_child("/Users", "/Users/foo"));
        assert!(is_same_or_child("/anything", "/"));
    }

    #[test]
    fn kind_tags() {
        assert_eq!(kind_tag("photos", true), "directory");
        assert_eq!(kind_tag("Report.PDF", false), "pdf");
        assert_eq!(kind_tag("archive.tar.gz", false), "gz");
        assert_eq!(kind_tag(".bashrc", false), "file");
        assert_eq!(kind_tag("Makefile", false), "file");
    }

    #[test]
    fn descendants_range_bounds() {
        let (lo, hi) = descendants_range("/a_b");
        assert_eq!((lo.as_str(), hi.as_str()), ("/a_b/", "/a_b0"));
        assert!("/a_b/x" >= lo.as_str() && "/a_b/x" < hi.as_str());
        assert!(!("/a_bc" >= lo.as_str() && "/a_bc" < hi.as_str()));
        assert_eq!(descendants_range("/"), ("/".to_string(), "0".to_string()));
    }
}
