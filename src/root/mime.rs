use std::collections::HashMap;
use std::path::Path;

/// Extension-based `Content-Type` lookup.
#[derive(Debug, Clone)]
pub struct MimeTypes {
    types: HashMap<String, String>,
    default_type: String,
    charset: String,
}

impl MimeTypes {
    /// Builds the table from the built-in types plus `overrides`.
    pub fn new(overrides: &HashMap<String, String>, default_type: &str, charset: &str) -> Self {
        let mut types: HashMap<String, String> = BUILTIN
            .iter()
            .map(|(ext, mime)| ((*ext).to_owned(), (*mime).to_owned()))
            .collect();
        for (ext, mime) in overrides {
            types.insert(ext.trim_start_matches('.').to_ascii_lowercase(), mime.clone());
        }
        Self {
            types,
            default_type: default_type.to_owned(),
            charset: charset.to_owned(),
        }
    }

    /// `Content-Type` for `path`; `text/*` types get the configured charset.
    pub fn lookup(&self, path: &Path) -> String {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let mime = self.types.get(&extension).unwrap_or(&self.default_type);

        if mime.starts_with("text/") && !self.charset.is_empty() && !mime.contains("charset") {
            format!("{}; charset={}", mime, self.charset)
        } else {
            mime.clone()
        }
    }
}

const BUILTIN: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("mjs", "text/javascript"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("md", "text/markdown"),
    ("xml", "application/xml"),
    ("json", "application/json"),
    ("map", "application/json"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("ico", "image/x-icon"),
    ("avif", "image/avif"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("otf", "font/otf"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("wasm", "application/wasm"),
    ("webmanifest", "application/manifest+json"),
];
