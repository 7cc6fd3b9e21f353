//! Static file fallback for requests no route claimed.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::http::{Method, Request, Response, StatusCode};

#[derive(Debug, Clone)]
struct Mount {
    prefix: String,
    dir: PathBuf,
}

/// Directories served for `GET`/`HEAD` requests, keyed by URL prefix.
///
/// Mount points are tried in registration order, then the base directory.
#[derive(Debug, Clone, Default)]
pub(crate) struct StaticFiles {
    mounts: Vec<Mount>,
    base_dir: Option<PathBuf>,
}

impl StaticFiles {
    pub(crate) fn set_base_dir(&mut self, dir: PathBuf) -> bool {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "static base directory does not exist");
            return false;
        }
        self.base_dir = Some(dir);
        true
    }

    pub(crate) fn add_mount(&mut self, prefix: &str, dir: PathBuf) -> bool {
        if !dir.is_dir() {
            warn!(prefix, dir = %dir.display(), "mount point directory does not exist");
            return false;
        }
        let prefix = match prefix.trim_end_matches('/') {
            "" => "/".to_owned(),
            p if p.starts_with('/') => p.to_owned(),
            p => format!("/{p}"),
        };
        self.mounts.push(Mount { prefix, dir });
        true
    }

    /// Fills `res` with the file `request` names, if there is one.
    pub(crate) async fn serve(&self, request: &Request, res: &mut Response) -> bool {
        if !matches!(request.method(), Method::Get | Method::Head) {
            return false;
        }

        let base = self.base_dir.iter().map(|dir| ("/", dir.as_path()));
        let roots = self
            .mounts
            .iter()
            .map(|m| (m.prefix.as_str(), m.dir.as_path()))
            .chain(base);

        for (prefix, dir) in roots {
            let Some(rest) = strip_mount(request.path(), prefix) else {
                continue;
            };
            let Some(relative) = sanitize(rest) else {
                debug!(path = request.path(), "refusing to serve path outside mount");
                return false;
            };
            if let Some((body, path)) = read_file(&dir.join(relative)).await {
                res.set_status(StatusCode::Ok);
                res.set_content(body, content_type(&path));
                return true;
            }
        }
        false
    }
}

async fn read_file(path: &Path) -> Option<(Vec<u8>, PathBuf)> {
    let mut path = path.to_path_buf();
    if tokio::fs::metadata(&path).await.ok()?.is_dir() {
        path.push("index.html");
    }
    let body = tokio::fs::read(&path).await.ok()?;
    Some((body, path))
}

fn strip_mount<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return path.strip_prefix('/');
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

/// Relative path for `rest`, or `None` if it tries to climb out with `..`.
fn sanitize(rest: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s if s.contains('\\') => return None,
            s => out.push(s),
        }
    }
    Some(out)
}

/// Content type by file extension.
pub(crate) fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request {
        Request::new(Method::Get, path)
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type(Path::new("a/index.HTML")), "text/html");
        assert_eq!(content_type(Path::new("app.js")), "application/javascript");
        assert_eq!(content_type(Path::new("logo.jpeg")), "image/jpeg");
        assert_eq!(content_type(Path::new("data.bin")), "application/octet-stream");
        assert_eq!(content_type(Path::new("README")), "application/octet-stream");
    }

    #[test]
    fn sanitize_rejects_parent_segments() {
        assert_eq!(sanitize("a/./b//c"), Some(PathBuf::from("a/b/c")));
        assert_eq!(sanitize("../etc/passwd"), None);
        assert_eq!(sanitize("a/../../b"), None);
    }

    #[test]
    fn mount_prefix_matches_whole_segments() {
        assert_eq!(strip_mount("/static/a.css", "/static"), Some("a.css"));
        assert_eq!(strip_mount("/static", "/static"), Some(""));
        assert_eq!(strip_mount("/statics/a.css", "/static"), None);
        assert_eq!(strip_mount("/x", "/"), Some("x"));
    }

    #[tokio::test]
    async fn serves_from_mounts_before_base_dir() {
        let base = tempfile::tempdir().unwrap();
        let assets = tempfile::tempdir().unwrap();
        std::fs::write(base.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::create_dir(base.path().join("assets")).unwrap();
        std::fs::write(base.path().join("assets/app.css"), "base").unwrap();
        std::fs::write(assets.path().join("app.css"), "mounted").unwrap();

        let mut files = StaticFiles::default();
        assert!(files.set_base_dir(base.path().to_path_buf()));
        assert!(files.add_mount("/assets/", assets.path().to_path_buf()));

        let mut res = Response::default();
        assert!(files.serve(&get("/assets/app.css"), &mut res).await);
        assert_eq!(res.text(), "mounted");
        assert_eq!(res.get_header("content-type"), Some("text/css"));

        let mut res = Response::default();
        assert!(files.serve(&get("/"), &mut res).await);
        assert_eq!(res.text(), "<h1>home</h1>");
        assert_eq!(res.get_header("content-type"), Some("text/html"));

        let mut res = Response::default();
        assert!(!files.serve(&get("/missing.txt"), &mut res).await);
        assert!(!files.serve(&get("/../secret"), &mut res).await);
        assert!(!files.serve(&Request::new(Method::Post, "/index.html"), &mut res).await);
    }

    #[test]
    fn missing_directories_are_refused() {
        let mut files = StaticFiles::default();
        assert!(!files.set_base_dir(PathBuf::from("/definitely/not/here")));
        assert!(!files.add_mount("/x", PathBuf::from("/definitely/not/here")));
    }
}
