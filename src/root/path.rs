//! Request path normalization.

use std::path::{Path, PathBuf};

/// Removes `.` and `..` segments as described in RFC 3986 §5.2.4.
///
/// `..` never climbs above the first segment, so an absolute input always
/// yields an absolute output.
///
/// ```
/// use aerie::root::remove_dot_segments;
///
/// assert_eq!(remove_dot_segments("/a/b/../c"), "/a/c");
/// assert_eq!(remove_dot_segments("/../a"), "/a");
/// assert_eq!(remove_dot_segments("/a/./b"), "/a/b");
/// ```
pub fn remove_dot_segments(path: &str) -> String {
    let mut input = path;
    let mut output: Vec<&str> = Vec::new();

    while !input.is_empty() {
        if let Some(rest) = input.strip_prefix("../") {
            input = rest;
        } else if let Some(rest) = input.strip_prefix("./") {
            input = rest;
        } else if input.starts_with("/./") {
            input = &input[2..];
        } else if input == "/." {
            input = "/";
        } else if input.starts_with("/../") {
            input = &input[3..];
            output.pop();
        } else if input == "/.." {
            input = "/";
            output.pop();
        } else if input == "." || input == ".." {
            input = "";
        } else {
            let skip = usize::from(input.starts_with('/'));
            let end = input[skip..].find('/').map_or(input.len(), |i| i + skip);
            output.push(&input[..end]);
            input = &input[end..];
        }
    }

    output.concat()
}

/// Decodes `%XX` escapes. Returns `None` for broken escapes, non-UTF-8
/// results and encoded NUL bytes.
pub fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            let byte = u8::from_str_radix(hex, 16).ok()?;
            if byte == 0 {
                return None;
            }
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Maps a request path onto `root`. Returns `None` when the path is not
/// absolute or cannot be decoded.
pub(crate) fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode(request_path)?;
    if !decoded.starts_with('/') || decoded.contains('\\') {
        return None;
    }
    let normalized = remove_dot_segments(&decoded);
    let relative = normalized.trim_start_matches('/');
    Some(if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    })
}
