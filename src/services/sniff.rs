//! Content-type detection from the leading bytes of a file.

/// Bytes inspected when sniffing.
pub const SNIFF_LEN: usize = 512;

pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Detect the MIME type of `content` from its first [`SNIFF_LEN`] bytes.
///
/// Magic numbers win; otherwise NUL-free UTF-8 is text and anything else
/// is `application/octet-stream`.
pub fn detect_content_type(content: &[u8]) -> String {
    let lead = &content[..content.len().min(SNIFF_LEN)];
    if let Some(kind) = infer::get(lead) {
        return kind.mime_type().to_string();
    }
    if looks_like_text(lead) {
        TEXT_PLAIN.to_string()
    } else {
        OCTET_STREAM.to_string()
    }
}

fn looks_like_text(lead: &[u8]) -> bool {
    if lead.contains(&0) {
        return false;
    }
    match std::str::from_utf8(lead) {
        Ok(_) => true,
        // a multi-byte character cut at the sniff boundary
        Err(err) => err.error_len().is_none(),
    }
}
