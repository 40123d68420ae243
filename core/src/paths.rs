//! Classification of key and dir strings.
//!
//! A *path* begins with `/` and contains no `//`. A *key* is a path that
//! does not end in `/` (so it can never be `/` itself) and a *dir* is a
//! path that does. The relative variants are the same strings without the
//! leading slash. All predicates are total over `&str`.

use crate::error::{Error, Result};

fn well_formed(s: &str, mut last: u8) -> bool {
    for &c in s.as_bytes() {
        if c == b'/' && last == b'/' {
            return false;
        }
        last = c;
    }
    true
}

/// Returns true if `s` is a path: `/`, `/a/b` and `/a/b/` all qualify.
pub fn is_path(s: &str) -> bool {
    s.starts_with('/') && well_formed(&s[1..], b'/')
}

/// Returns true if `s` is a key: a path with no trailing slash.
pub fn is_key(s: &str) -> bool {
    is_path(s) && !s.ends_with('/')
}

/// Returns true if `s` is a dir: a path with a trailing slash.
pub fn is_dir(s: &str) -> bool {
    is_path(s) && s.ends_with('/')
}

/// Returns true if `s` is a relative path. The empty string qualifies.
pub fn is_rel_path(s: &str) -> bool {
    well_formed(s, b'/')
}

/// Returns true if `s` is a relative key.
pub fn is_rel_key(s: &str) -> bool {
    is_rel_path(s) && !s.is_empty() && !s.ends_with('/')
}

/// Returns true if `s` is a relative dir. The empty string qualifies.
pub fn is_rel_dir(s: &str) -> bool {
    is_rel_path(s) && (s.is_empty() || s.ends_with('/'))
}

pub fn require_path(s: &str) -> Result<()> {
    if is_path(s) {
        Ok(())
    } else {
        Err(Error::InvalidPath(s.to_owned()))
    }
}

pub fn require_key(s: &str) -> Result<()> {
    if is_key(s) {
        Ok(())
    } else {
        Err(Error::InvalidPath(s.to_owned()))
    }
}

pub fn require_dir(s: &str) -> Result<()> {
    if is_dir(s) {
        Ok(())
    } else {
        Err(Error::InvalidPath(s.to_owned()))
    }
}

/// Iterates the dirs enclosing `path`, outermost first: for `/a/b/c`
/// yields `/`, `/a/`, `/a/b/`; for `/a/b/` additionally yields itself.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let bytes = path.as_bytes();
    (0..bytes.len())
        .filter(move |&i| bytes[i] == b'/')
        .map(move |i| &path[..=i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify() {
        for (s, path, key, dir) in [
            ("/", true, false, true),
            ("/a", true, true, false),
            ("/a/", true, false, true),
            ("/a/b", true, true, false),
            ("", false, false, false),
            ("a", false, false, false),
            ("a/b", false, false, false),
            ("//", false, false, false),
            ("/a//b", false, false, false),
            ("/a/b//", false, false, false),
        ] {
            assert_eq!(is_path(s), path, "{:?}", s);
            assert_eq!(is_key(s), key, "{:?}", s);
            assert_eq!(is_dir(s), dir, "{:?}", s);
        }
    }

    #[test]
    fn classify_rel() {
        for (s, path, key, dir) in [
            ("", true, false, true),
            ("a", true, true, false),
            ("a/", true, false, true),
            ("a/b", true, true, false),
            ("/a", false, false, false),
            ("a//b", false, false, false),
        ] {
            assert_eq!(is_rel_path(s), path, "{:?}", s);
            assert_eq!(is_rel_key(s), key, "{:?}", s);
            assert_eq!(is_rel_dir(s), dir, "{:?}", s);
        }
    }

    #[test]
    fn enclosing_dirs() {
        let dirs: Vec<_> = ancestors("/a/b/c").collect();
        assert_eq!(dirs, ["/", "/a/", "/a/b/"]);
        let dirs: Vec<_> = ancestors("/a/").collect();
        assert_eq!(dirs, ["/", "/a/"]);
        let dirs: Vec<_> = ancestors("/").collect();
        assert_eq!(dirs, ["/"]);
    }
}
