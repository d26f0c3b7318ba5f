/// Canonicalizes a request target for route lookup: splits on `/`, drops
/// empty and `.` segments, resolves each `..` against the previous
/// segment, and rejects traversal past the root with `None`. This is a
/// lookup key, not a rewrite of the on-wire target.
pub fn canonicalize(target: &str) -> Option<String> {
    let mut canonical: Vec<&str> = Vec::new();

    for component in target.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                canonical.pop()?;
            }
            component => canonical.push(component),
        }
    }

    if canonical.is_empty() {
        return Some("/".to_string());
    }

    let mut result = String::with_capacity(target.len());
    for component in canonical {
        result.push('/');
        result.push_str(component);
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(target: &str) -> String {
        canonicalize(target).unwrap()
    }

    #[test]
    fn test_root_forms() {
        assert_eq!(ok(""), "/");
        assert_eq!(ok("/"), "/");
        assert_eq!(ok("//"), "/");
        assert_eq!(ok("/."), "/");
        assert_eq!(ok("/./"), "/");
        assert_eq!(ok("/./."), "/");
    }

    #[test]
    fn test_plain_segments() {
        assert_eq!(ok("/foo"), "/foo");
        assert_eq!(ok("/foo/"), "/foo");
        assert_eq!(ok("/foo/."), "/foo");
        assert_eq!(ok("/foo//"), "/foo");
        assert_eq!(ok("//foo//bar"), "/foo/bar");
        assert_eq!(ok("/foo/./bar"), "/foo/bar");
        assert_eq!(ok("/foo/bar//."), "/foo/bar");
    }

    #[test]
    fn test_parent_segments() {
        assert_eq!(ok("/foo/bar/.."), "/foo");
        assert_eq!(ok("/foo/bar/../"), "/foo");
        assert_eq!(ok("/foo/./bar/.."), "/foo");
        assert_eq!(ok("/foo/bar/../."), "/foo");
        assert_eq!(ok("/foo/../bar"), "/bar");
        assert_eq!(ok("/foo/.././bar"), "/bar");
        assert_eq!(ok("/foo/../bar//"), "/bar");
    }

    #[test]
    fn test_traversal_past_root_rejected() {
        assert_eq!(canonicalize("/.."), None);
        assert_eq!(canonicalize("/foo/../.."), None);
        assert_eq!(canonicalize("/foo/../../bar"), None);
        assert_eq!(canonicalize("/foo/.././.."), None);
        assert_eq!(canonicalize("/foo/../bar/../.."), None);
    }

    #[test]
    fn test_idempotent() {
        for target in &["/foo/./bar/..", "//foo//bar", "/", "", "/a/b/c"] {
            let once = canonicalize(target).unwrap();
            let twice = canonicalize(&once).unwrap();
            assert_eq!(once, twice);
            assert!(twice.starts_with('/'));
            assert!(!twice.contains("/./"));
            assert!(!twice.contains("/../"));
        }
    }
}
