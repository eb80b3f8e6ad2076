//! Lexical path handling for slash-separated paths.
//!
//! The composition pipeline models host paths as posix-style strings so that
//! the same canonicalization rules apply to the in-memory and host-backed
//! file systems. All functions here are purely lexical; nothing touches the
//! file system.

/// Lexically cleans a slash-separated path.
///
/// Collapses repeated separators, eliminates `.` components, and resolves
/// `..` components against their parent where one exists. A `..` at the root
/// of an absolute path is dropped. Returns `"."` for an empty result.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => match out.last() {
                Some(&"..") => out.push(".."),
                Some(_) => {
                    out.pop();
                }
                None => {
                    if !rooted {
                        out.push("..");
                    }
                }
            },
            other => out.push(other),
        }
    }
    let joined = out.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Joins two path fragments and cleans the result.
///
/// An empty fragment is ignored rather than contributing a separator.
pub fn join(base: &str, rest: &str) -> String {
    if base.is_empty() {
        return clean(rest);
    }
    if rest.is_empty() {
        return clean(base);
    }
    clean(&format!("{base}/{rest}"))
}

/// Returns all but the last component of the path, cleaned.
///
/// Mirrors posix `dirname`: `parent("a/b") == "a"`, `parent("a") == "."`,
/// `parent("/a") == "/"`.
pub fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => clean(&path[..i]),
        None => ".".to_string(),
    }
}

/// Returns the volume prefix of the path.
///
/// Always empty for the posix-style paths this crate models; kept as a
/// named operation because the bind-root containment check is defined in
/// terms of volume equality.
pub fn volume_name(_path: &str) -> &'static str {
    ""
}

/// Computes the path that reaches `target` relative to `base`.
///
/// Both arguments must already be cleaned and either both absolute or both
/// relative. Used to derive tar symlink link-names from in-archive paths.
pub fn relative(base: &str, target: &str) -> String {
    if base == target {
        return ".".to_string();
    }
    let base_comps: Vec<&str> = base.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    let target_comps: Vec<&str> = target
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    let common = base_comps
        .iter()
        .zip(target_comps.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out: Vec<&str> = Vec::with_capacity(base_comps.len() - common + target_comps.len() - common);
    for _ in common..base_comps.len() {
        out.push("..");
    }
    out.extend(&target_comps[common..]);
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}

/// Splits a cleaned path into its non-empty components.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean("/a//b/./c"), "/a/b/c");
        assert_eq!(clean("a/b/../c"), "a/c");
        assert_eq!(clean("/../a"), "/a");
        assert_eq!(clean("../a"), "../a");
        assert_eq!(clean(""), ".");
        assert_eq!(clean("/"), "/");
        assert_eq!(clean("a/"), "a");
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("/a/b"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("a/b"), "a");
        assert_eq!(parent("a"), ".");
    }

    #[test]
    fn test_relative() {
        assert_eq!(relative("renamed", "renamed/file"), "file");
        assert_eq!(relative("a/b", "a/c/d"), "../c/d");
        assert_eq!(relative("/a", "/a"), ".");
        assert_eq!(relative(".", "renamed"), "renamed");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/a", "b/c"), "/a/b/c");
        assert_eq!(join("", "b"), "b");
        assert_eq!(join("/a", ""), "/a");
    }
}
