//! Filesystem helpers for static content.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::prelude::{HTTP_FORBIDDEN, HTTP_INTERNAL_SERVER_ERROR, HTTP_NOT_FOUND};

pub fn mime_type(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

pub fn status_for_io_error(err: &std::io::Error) -> u16 {
    match err.kind() {
        ErrorKind::NotFound => HTTP_NOT_FOUND,
        ErrorKind::PermissionDenied => HTTP_FORBIDDEN,
        _ => HTTP_INTERNAL_SERVER_ERROR,
    }
}

/// Joins a request target onto a document root. Targets that try to
/// climb out with `..` are rejected.
pub fn resolve_path(root: &str, target: &str) -> Option<PathBuf> {
    if target.split('/').any(|seg| seg == "..") {
        return None;
    }
    let mut path = PathBuf::from(root);
    path.push(target.trim_start_matches('/'));
    Some(path)
}

pub fn is_file(path: &Path) -> bool {
    path.is_file()
}

pub fn is_directory(path: &Path) -> bool {
    path.is_dir()
}

/// HTML directory listing for autoindex. Hidden entries are skipped,
/// directories get a trailing slash.
pub fn autoindex_html(dir: &Path, target: &str) -> std::io::Result<String> {
    let mut html = format!(
        "<html>\n<head><title>Index of {target}</title></head>\n<body>\n<h1>Index of {target}</h1>\n<hr>\n<ul>\n"
    );
    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let mut name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name.starts_with('.') {
            continue;
        }
        if entry.path().is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();
    let base = target.trim_end_matches('/');
    for name in names {
        html.push_str(&format!("<li><a href=\"{base}/{name}\">{name}</a></li>\n"));
    }
    html.push_str("</ul>\n<hr>\n</body>\n</html>\n");
    Ok(html)
}
