//! `multipart/form-data` body parsing.

use bytes::Bytes;
use memchr::memmem;

/// One part of a `multipart/form-data` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartFormData {
    /// The `name` parameter of the part's `Content-Disposition`.
    pub name: String,
    pub content: Bytes,
    /// The `filename` parameter, empty for plain fields.
    pub filename: String,
    /// The part's own `Content-Type`, empty when absent.
    pub content_type: String,
}

/// Extracts the boundary from a `multipart/form-data; boundary=...` content type.
pub fn boundary(content_type: &str) -> Option<&str> {
    let mut parts = content_type.split(';');
    let media = parts.next()?.trim();
    if !media.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    parts.find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| v.trim().trim_matches('"'))
            .filter(|b| !b.is_empty())
    })
}

/// Splits `body` into its parts. Malformed trailing data is ignored; parts
/// parsed before it are kept.
pub fn parse(body: &Bytes, boundary: &str) -> Vec<MultipartFormData> {
    let delimiter = format!("--{boundary}");
    let next_delimiter = format!("\r\n--{boundary}");
    let finder = memmem::Finder::new(delimiter.as_bytes());
    let next_finder = memmem::Finder::new(next_delimiter.as_bytes());

    let mut items = Vec::new();
    let Some(start) = finder.find(body) else {
        return items;
    };
    let mut pos = start + delimiter.len();

    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            break;
        }
        let Some(rest) = rest.strip_prefix(b"\r\n") else {
            break;
        };
        pos = body.len() - rest.len();

        let Some(head_len) = memmem::find(rest, b"\r\n\r\n") else {
            break;
        };
        let head = String::from_utf8_lossy(&rest[..head_len]);
        let content_start = pos + head_len + 4;

        let Some(content_len) = next_finder.find(&body[content_start..]) else {
            break;
        };
        let mut item = MultipartFormData {
            content: body.slice(content_start..content_start + content_len),
            ..Default::default()
        };
        for line in head.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("content-disposition") {
                item.name = disposition_param(value, "name").unwrap_or_default();
                item.filename = disposition_param(value, "filename").unwrap_or_default();
            } else if name.trim().eq_ignore_ascii_case("content-type") {
                item.content_type = value.trim().to_owned();
            }
        }
        items.push(item);

        pos = content_start + content_len + next_delimiter.len();
    }

    items
}

fn disposition_param(value: &str, key: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"').to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "--XyZ\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\r\n\
        hello\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        line1\r\nline2\r\n\
        --XyZ--\r\n";

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(
            boundary("multipart/form-data; boundary=XyZ"),
            Some("XyZ")
        );
        assert_eq!(
            boundary("Multipart/Form-Data; charset=utf-8; boundary=\"q q\""),
            Some("q q")
        );
        assert_eq!(boundary("text/plain; boundary=XyZ"), None);
        assert_eq!(boundary("multipart/form-data"), None);
    }

    #[test]
    fn parses_fields_and_files() {
        let items = parse(&Bytes::from_static(BODY.as_bytes()), "XyZ");
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].name, "title");
        assert_eq!(items[0].content, Bytes::from_static(b"hello"));
        assert!(items[0].filename.is_empty());

        assert_eq!(items[1].name, "upload");
        assert_eq!(items[1].filename, "a.txt");
        assert_eq!(items[1].content_type, "text/plain");
        assert_eq!(items[1].content, Bytes::from_static(b"line1\r\nline2"));
    }

    #[test]
    fn truncated_body_keeps_complete_parts() {
        let truncated = &BODY[..BODY.find("line1").unwrap()];
        let items = parse(&Bytes::copy_from_slice(truncated.as_bytes()), "XyZ");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "title");
    }
}
