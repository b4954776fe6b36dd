//! Form bodies: URL-encoded fields or multipart when files are attached.

use crate::http::url;

/// MIME type for a filename, inferred from its extension. Unknown
/// extensions map to `application/octet-stream`; a name without an
/// extension is treated as plain text.
pub fn mime_type(filename: &str) -> &'static str {
    let Some((_, ext)) = filename.rsplit_once('.') else {
        return "text/plain";
    };
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "bmp" => "image/bmp",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "txt" | "text" | "log" => "text/plain",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "wasm" => "application/wasm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

struct FilePart {
    name: String,
    filename: String,
    content_type: String,
    data: Vec<u8>,
}

/// A form body for POST/PUT requests.
///
/// With only fields the body serializes as
/// `application/x-www-form-urlencoded`; attaching any file switches to
/// `multipart/form-data` with a random boundary.
pub struct Form {
    fields: Vec<(String, String)>,
    files: Vec<FilePart>,
    boundary: String,
}

impl Default for Form {
    fn default() -> Self {
        Self::new()
    }
}

impl Form {
    pub fn new() -> Form {
        let tag: [u8; 16] = rand::random();
        let mut boundary = String::with_capacity(48);
        boundary.push_str("----kindling");
        for byte in tag {
            boundary.push_str(&format!("{byte:02x}"));
        }
        Form {
            fields: Vec::new(),
            files: Vec::new(),
            boundary,
        }
    }

    /// Adds one text field. Chainable.
    pub fn field(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Form {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Adds several text fields.
    pub fn fields<I, K, V>(&mut self, pairs: I) -> &mut Form
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in pairs {
            self.fields.push((name.into(), value.into()));
        }
        self
    }

    /// Attaches a file part, inferring its MIME type from the filename.
    pub fn file(
        &mut self,
        name: impl Into<String>,
        data: impl Into<Vec<u8>>,
        filename: impl Into<String>,
    ) -> &mut Form {
        let filename = filename.into();
        let content_type = mime_type(&filename).to_string();
        self.file_with_type(name, data, filename, content_type)
    }

    /// Attaches a file part with an explicit MIME type.
    pub fn file_with_type(
        &mut self,
        name: impl Into<String>,
        data: impl Into<Vec<u8>>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> &mut Form {
        self.files.push(FilePart {
            name: name.into(),
            filename: filename.into(),
            content_type: content_type.into(),
            data: data.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.files.is_empty()
    }

    pub fn is_multipart(&self) -> bool {
        !self.files.is_empty()
    }

    /// The `Content-Type` header value for this form.
    pub fn content_type(&self) -> String {
        if self.is_multipart() {
            format!("multipart/form-data; boundary={}", self.boundary)
        } else {
            "application/x-www-form-urlencoded".to_string()
        }
    }

    /// Serializes the body.
    pub fn body(&self) -> Vec<u8> {
        if !self.is_multipart() {
            return url::encode_form(
                self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            )
            .into_bytes();
        }

        let mut out = Vec::new();
        for (name, value) in &self.fields {
            out.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
            out.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            );
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        for file in &self.files {
            out.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
            out.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    file.name, file.filename
                )
                .as_bytes(),
            );
            out.extend_from_slice(
                format!("Content-Type: {}\r\n\r\n", file.content_type).as_bytes(),
            );
            out.extend_from_slice(&file.data);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        out
    }
}

impl std::fmt::Debug for Form {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Form")
            .field("fields", &self.fields.len())
            .field("files", &self.files.len())
            .field("multipart", &self.is_multipart())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoded_single_field() {
        let mut form = Form::new();
        form.field("name", "John");
        assert!(!form.is_empty());
        assert!(!form.is_multipart());
        assert_eq!(form.content_type(), "application/x-www-form-urlencoded");
        assert_eq!(form.body(), b"name=John");
    }

    #[test]
    fn urlencoded_multiple_fields() {
        let mut form = Form::new();
        form.field("username", "john").field("password", "secret123");
        assert_eq!(form.body(), b"username=john&password=secret123");
    }

    #[test]
    fn urlencoded_escapes_special_characters() {
        let mut form = Form::new();
        form.field("email", "user@example.com")
            .field("message", "Hello World!");
        assert_eq!(
            form.body(),
            b"email=user%40example.com&message=Hello+World%21"
        );
    }

    #[test]
    fn fields_from_iterator() {
        let mut form = Form::new();
        form.fields([("a", "1"), ("b", "2"), ("c", "3")]);
        assert_eq!(form.body(), b"a=1&b=2&c=3");
    }

    #[test]
    fn file_switches_to_multipart() {
        let mut form = Form::new();
        form.field("name", "test")
            .file_with_type("data", &b"file content here"[..], "test.txt", "text/plain");
        assert!(form.is_multipart());
        let content_type = form.content_type();
        assert!(content_type.starts_with("multipart/form-data"));
        assert!(content_type.contains("boundary="));
    }

    #[test]
    fn multipart_body_layout() {
        let mut form = Form::new();
        form.field("name", "John")
            .file_with_type("doc", &b"Hello World"[..], "hello.txt", "text/plain");
        let body = String::from_utf8(form.body()).unwrap();

        assert!(body.contains("Content-Disposition: form-data; name=\"name\""));
        assert!(body.contains("John"));
        assert!(body.contains("Content-Disposition: form-data; name=\"doc\"; filename=\"hello.txt\""));
        assert!(body.contains("Content-Type: text/plain"));
        assert!(body.contains("Hello World"));
        assert!(body.trim_end().ends_with("--"));
    }

    #[test]
    fn file_type_inference() {
        let mut form = Form::new();
        form.file("image", vec![0x89u8, 0x50, 0x4e, 0x47], "test.png");
        let body = String::from_utf8_lossy(&form.body()).into_owned();
        assert!(body.contains("Content-Type: image/png"));
    }

    #[test]
    fn mime_table() {
        assert_eq!(mime_type("photo.jpg"), "image/jpeg");
        assert_eq!(mime_type("photo.JPEG"), "image/jpeg");
        assert_eq!(mime_type("image.png"), "image/png");
        assert_eq!(mime_type("animation.gif"), "image/gif");
        assert_eq!(mime_type("icon.svg"), "image/svg+xml");
        assert_eq!(mime_type("doc.pdf"), "application/pdf");
        assert_eq!(mime_type("data.json"), "application/json");
        assert_eq!(mime_type("page.html"), "text/html");
        assert_eq!(mime_type("styles.css"), "text/css");
        assert_eq!(mime_type("archive.zip"), "application/zip");
        assert_eq!(mime_type("archive.gz"), "application/gzip");
        assert_eq!(mime_type("file.xyz"), "application/octet-stream");
        assert_eq!(mime_type("noext"), "text/plain");
    }

    #[test]
    fn empty_states() {
        let form = Form::new();
        assert!(form.is_empty());
        assert!(!form.is_multipart());

        let mut with_field = Form::new();
        with_field.field("x", "y");
        assert!(!with_field.is_empty());

        let mut with_file = Form::new();
        with_file.file("f", &b"content"[..], "file.txt");
        assert!(!with_file.is_empty());
    }

    #[test]
    fn boundaries_are_unique() {
        assert_ne!(Form::new().boundary, Form::new().boundary);
    }
}
