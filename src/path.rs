//! Slash-delimited path codec for addressing nodes inside a replicated
//! value tree.
//!
//! A path is a string like `/items/0/title`. A literal `/` inside a
//! segment is escaped as `~1`, so the segment `a/b` appears on the wire
//! as `a~1b`. The root path is `/` and corresponds to the empty segment
//! list.

/// Escape a single segment for embedding in a path string.
pub fn escape(segment: &str) -> String {
    segment.replace('/', "~1")
}

/// Undo [`escape`].
pub fn unescape(segment: &str) -> String {
    segment.replace("~1", "/")
}

/// Split a path string into its ordered segments.
///
/// Strips the leading separator, splits on `/`, and un-escapes each
/// segment. The root path (`/` or the empty string) yields an empty
/// list.
pub fn to_segments(path: &str) -> Vec<String> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let segments: Vec<String> = trimmed.split('/').map(unescape).collect();
    if segments.len() == 1 && segments[0].is_empty() {
        Vec::new()
    } else {
        segments
    }
}

/// Join segments back into a path string with a single leading separator.
pub fn to_path_string<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::from("/");
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(&escape(segment.as_ref()));
    }
    out
}

/// Append one (escaped) segment to a base path.
pub fn join(base: &str, segment: &str) -> String {
    let mut out = String::with_capacity(base.len() + segment.len() + 1);
    out.push_str(base);
    if !base.ends_with('/') {
        out.push('/');
    }
    out.push_str(&escape(segment));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_path() {
        assert_eq!(to_segments("/"), Vec::<String>::new());
        assert_eq!(to_segments(""), Vec::<String>::new());
        assert_eq!(to_path_string(&[] as &[&str]), "/");
    }

    #[test]
    fn test_round_trip() {
        for path in ["/a", "/a/b/c", "/items/0/title", "/x~1y/z"] {
            let segments = to_segments(path);
            assert_eq!(to_path_string(&segments), path);
        }
    }

    #[test]
    fn test_escaped_segment_survives() {
        let segments = to_segments("/config/a~1b");
        assert_eq!(segments, vec!["config".to_string(), "a/b".to_string()]);
        assert_eq!(to_path_string(&segments), "/config/a~1b");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "items"), "/items");
        assert_eq!(join("/items", "0"), "/items/0");
        assert_eq!(join("/items/", "0"), "/items/0");
        assert_eq!(join("/config", "a/b"), "/config/a~1b");
    }
}
