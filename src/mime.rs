//! Content sniffing for uploaded attachments.
//!
//! The MIME type of an upload is derived from its leading bytes rather than
//! from whatever the client claimed, so a renamed file cannot slip past a
//! field's `mimeTypes` list.

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Detect the MIME type of a file from its content
pub fn sniff(bytes: &[u8]) -> &'static str {
    if bytes.is_empty() {
        return OCTET_STREAM;
    }

    // Container formats with a brand or sub-type field
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" {
        match &bytes[8..12] {
            b"AVI " => return "video/x-msvideo",
            b"WAVE" => return "audio/x-wav",
            b"WEBP" => return "image/webp",
            _ => {}
        }
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return match &bytes[8..12] {
            b"M4A " | b"M4B " | b"M4P " | b"F4A " | b"F4B " => "audio/mp4",
            b"qt  " => "video/quicktime",
            b"3gp4" | b"3gp5" | b"3gp6" => "video/3gpp",
            _ => "video/mp4",
        };
    }

    if bytes.starts_with(b"ID3") {
        return "audio/mpeg";
    }
    // MPEG audio frame sync: 11 set bits, layer bits not reserved
    if bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 && (bytes[1] & 0x06) != 0 {
        return "audio/mpeg";
    }
    if bytes.starts_with(b"OggS") {
        return "audio/ogg";
    }
    if bytes.starts_with(b"fLaC") {
        return "audio/flac";
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return "image/png";
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if bytes.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return "video/webm";
    }

    if let Ok(text) = std::str::from_utf8(&bytes[..bytes.len().min(512)]) {
        let head = text.trim_start();
        if head.starts_with("<svg") || (head.starts_with("<?xml") && text.contains("<svg")) {
            return "image/svg+xml";
        }
        if !text.chars().any(|c| c.is_control() && !c.is_whitespace()) {
            return "text/plain; charset=utf-8";
        }
    }

    OCTET_STREAM
}

/// Whether `detected` satisfies an allow-list (an empty list allows anything)
pub fn is_allowed(detected: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let essence = detected.split(';').next().unwrap_or(detected).trim();
    allowed.iter().any(|a| a.eq_ignore_ascii_case(essence))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_types() -> Vec<String> {
        vec![
            "audio/mp4".to_string(),
            "audio/mpeg".to_string(),
            "video/x-msvideo".to_string(),
        ]
    }

    #[test]
    fn test_sniff_audio_formats() {
        assert_eq!(sniff(b"ID3\x04\x00\x00\x00\x00\x00\x00"), "audio/mpeg");
        assert_eq!(sniff(&[0xFF, 0xFB, 0x90, 0x64]), "audio/mpeg");
        assert_eq!(sniff(b"\x00\x00\x00\x20ftypM4A \x00\x00\x00\x00"), "audio/mp4");
        assert_eq!(sniff(b"RIFF\x00\x00\x00\x00AVI LIST"), "video/x-msvideo");
        assert_eq!(sniff(b"RIFF\x00\x00\x00\x00WAVEfmt "), "audio/x-wav");
        assert_eq!(sniff(b"OggS\x00\x02"), "audio/ogg");
    }

    #[test]
    fn test_sniff_other_formats() {
        assert_eq!(sniff(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0]), "image/png");
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff(b"\x00\x00\x00\x18ftypisom\x00\x00"), "video/mp4");
        assert_eq!(sniff(b"hello world"), "text/plain; charset=utf-8");
        assert_eq!(sniff(&[0x00, 0x01, 0x02, 0x03]), OCTET_STREAM);
        assert_eq!(sniff(&[]), OCTET_STREAM);
    }

    #[test]
    fn test_allow_list() {
        assert!(is_allowed("audio/mpeg", &audio_types()));
        assert!(is_allowed("video/x-msvideo", &audio_types()));
        assert!(!is_allowed("audio/x-wav", &audio_types()));
        assert!(!is_allowed("text/plain; charset=utf-8", &audio_types()));
        assert!(is_allowed("text/plain; charset=utf-8", &["text/plain".to_string()]));
        assert!(is_allowed("anything/else", &[]));
    }
}
