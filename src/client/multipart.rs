//! Multipart form assembly (RFC 7578), with a caller-controllable
//! boundary so fingerprint presets can shape it.

use bytes::Bytes;

/// A `multipart/form-data` body under construction.
#[derive(Debug, Default)]
pub struct Form {
    parts: Vec<Part>,
    boundary: Option<String>,
}

/// One part of a multipart form.
#[derive(Debug)]
pub struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

impl Part {
    #[must_use]
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        }
    }

    #[must_use]
    pub fn bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: Some("application/octet-stream".to_owned()),
            data: data.into(),
        }
    }

    /// A file part with explicit filename and content type.
    #[must_use]
    pub fn file(
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            data: data.into(),
        }
    }
}

impl Form {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    /// Overrides the generated boundary.
    #[must_use]
    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = Some(boundary.into());
        self
    }

    pub(crate) fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    pub(crate) fn encode(&self, boundary: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(b"--");
            out.extend_from_slice(boundary.as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(b"Content-Disposition: form-data; name=\"");
            out.extend_from_slice(part.name.as_bytes());
            out.push(b'"');
            if let Some(filename) = &part.filename {
                out.extend_from_slice(b"; filename=\"");
                out.extend_from_slice(filename.as_bytes());
                out.push(b'"');
            }
            out.extend_from_slice(b"\r\n");
            if let Some(content_type) = &part.content_type {
                out.extend_from_slice(b"Content-Type: ");
                out.extend_from_slice(content_type.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&part.data);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");
        out
    }
}

/// The default boundary format: random hex with a stable prefix.
pub(crate) fn default_boundary() -> String {
    let tail: u64 = rand::random();
    format!("fletch-{tail:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_shape() {
        let form = Form::new()
            .part(Part::text("k", "v"))
            .part(Part::file("f", "a.bin", "application/octet-stream", &b"\x00\x01"[..]));
        let body = String::from_utf8_lossy(&form.encode("XYZ")).into_owned();

        assert!(body.starts_with("--XYZ\r\nContent-Disposition: form-data; name=\"k\"\r\n\r\nv\r\n"));
        assert!(body.contains("name=\"f\"; filename=\"a.bin\""));
        assert!(body.contains("Content-Type: application/octet-stream\r\n"));
        assert!(body.ends_with("--XYZ--\r\n"));
    }

    #[test]
    fn default_boundary_is_unique_enough() {
        assert_ne!(default_boundary(), default_boundary());
        assert!(default_boundary().starts_with("fletch-"));
    }
}
