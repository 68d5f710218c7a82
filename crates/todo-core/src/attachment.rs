//! Attachment keys and upload policy.
//!
//! Entity-scoped attachments live under `desc/{filename}` (the todo
//! description) or `note/{noteId}/{filename}`. Deduplicated blobs are stored
//! as `{namespace}/{sha256}` so identical bytes always land on the same key.
//!
//! The content type is asserted by the caller and never sniffed from the
//! payload; the allow-list is a policy boundary, not a format guarantee.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MAX_ATTACHMENT_BYTES: i64 = 5 * 1024 * 1024;
pub const ALLOWED_CONTENT_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "application/pdf",
];
pub const DEFAULT_BLOB_NAMESPACE: &str = "blob";

const KEY_SEPARATOR: char = '/';
const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachmentError {
    #[error("note attachments require a note id")]
    MissingNoteId,
    #[error("attachment filename is empty")]
    EmptyFilename,
    #[error("File type {0} is not allowed")]
    InvalidAttachmentType(String),
    #[error("File size exceeds 5MB limit")]
    TooLarge { size: i64, max: i64 },
    #[error("Invalid file size")]
    InvalidSize(i64),
    #[error("attachment payload is not valid base64: {0}")]
    InvalidPayload(String),
    #[error("blob namespace is empty or contains '/'")]
    InvalidNamespace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Desc,
    Note,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Desc => "desc",
            AttachmentKind::Note => "note",
        }
    }

    fn segment_count(&self) -> usize {
        match self {
            AttachmentKind::Desc => 2,
            AttachmentKind::Note => 3,
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "desc" => Ok(AttachmentKind::Desc),
            "note" => Ok(AttachmentKind::Note),
            other => Err(format!("Unknown attachment type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedAttachmentKey {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
}

/// Replaces path separators with `_`, drops NUL bytes and trims whitespace.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|ch| *ch != '\0')
        .map(|ch| if ch == '/' || ch == '\\' { '_' } else { ch })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn build_attachment_key(
    kind: AttachmentKind,
    filename: &str,
    note_id: Option<&str>,
) -> Result<String, AttachmentError> {
    let filename = sanitize_filename(filename);
    if filename.is_empty() {
        return Err(AttachmentError::EmptyFilename);
    }
    match kind {
        AttachmentKind::Desc => Ok(format!("{kind}{KEY_SEPARATOR}{filename}")),
        AttachmentKind::Note => {
            let note_id = note_id
                .map(sanitize_filename)
                .filter(|id| !id.is_empty())
                .ok_or(AttachmentError::MissingNoteId)?;
            Ok(format!(
                "{kind}{KEY_SEPARATOR}{note_id}{KEY_SEPARATOR}{filename}"
            ))
        }
    }
}

/// Strict inverse of [`build_attachment_key`]. Anything malformed is `None`.
pub fn parse_attachment_key(key: &str) -> Option<ParsedAttachmentKey> {
    let segments = key.split(KEY_SEPARATOR).collect::<Vec<_>>();
    let kind = segments.first()?.parse::<AttachmentKind>().ok()?;
    if segments.len() != kind.segment_count()
        || segments.iter().any(|segment| segment.is_empty())
    {
        return None;
    }
    match kind {
        AttachmentKind::Desc => Some(ParsedAttachmentKey {
            kind,
            filename: segments[1].to_string(),
            note_id: None,
        }),
        AttachmentKind::Note => Some(ParsedAttachmentKey {
            kind,
            filename: segments[2].to_string(),
            note_id: Some(segments[1].to_string()),
        }),
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Hashes the decoded bytes of a base64 payload. A `data:` URL prefix is
/// accepted and ignored.
pub fn hash_base64_payload(payload: &str) -> Result<String, AttachmentError> {
    let bytes = decode_base64_payload(payload)?;
    Ok(hash_bytes(&bytes))
}

pub fn decode_base64_payload(payload: &str) -> Result<Vec<u8>, AttachmentError> {
    let encoded = match payload.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => payload,
    };
    STANDARD
        .decode(encoded.trim())
        .map_err(|err| AttachmentError::InvalidPayload(err.to_string()))
}

pub fn build_content_doc_id(namespace: &str, hash: &str) -> Result<String, AttachmentError> {
    if namespace.is_empty() || namespace.contains(KEY_SEPARATOR) {
        return Err(AttachmentError::InvalidNamespace);
    }
    Ok(format!("{namespace}{KEY_SEPARATOR}{hash}"))
}

/// Splits `{namespace}/{sha256}`; the hash must be 64 lowercase hex chars.
pub fn parse_content_doc_id(doc_id: &str) -> Option<(String, String)> {
    let (namespace, hash) = doc_id.split_once(KEY_SEPARATOR)?;
    let valid_hash = hash.len() == SHA256_HEX_LEN
        && hash
            .chars()
            .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch));
    if namespace.is_empty() || !valid_hash {
        return None;
    }
    Some((namespace.to_string(), hash.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentValidation {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn check_attachment(size_bytes: i64, content_type: &str) -> Result<(), AttachmentError> {
    if size_bytes <= 0 {
        return Err(AttachmentError::InvalidSize(size_bytes));
    }
    if size_bytes > MAX_ATTACHMENT_BYTES {
        return Err(AttachmentError::TooLarge {
            size: size_bytes,
            max: MAX_ATTACHMENT_BYTES,
        });
    }
    if !ALLOWED_CONTENT_TYPES.contains(&content_type) {
        return Err(AttachmentError::InvalidAttachmentType(
            content_type.to_string(),
        ));
    }
    Ok(())
}

pub fn validate_attachment(size_bytes: i64, content_type: &str) -> AttachmentValidation {
    match check_attachment(size_bytes, content_type) {
        Ok(()) => AttachmentValidation {
            valid: true,
            error: None,
        },
        Err(err) => AttachmentValidation {
            valid: false,
            error: Some(err.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_key_builds_and_parses_back() {
        let key = build_attachment_key(AttachmentKind::Note, "photo.jpg", Some("abc-123"))
            .expect("build note key");
        assert_eq!(key, "note/abc-123/photo.jpg");
        assert_eq!(
            parse_attachment_key(&key),
            Some(ParsedAttachmentKey {
                kind: AttachmentKind::Note,
                filename: "photo.jpg".to_string(),
                note_id: Some("abc-123".to_string()),
            })
        );
    }

    #[test]
    fn desc_key_round_trips_for_sanitized_names() {
        for name in ["a.png", "scan 01.pdf", "../../etc/passwd", "  spaced.gif  ", "x\0y.webp"] {
            let key = build_attachment_key(AttachmentKind::Desc, name, None).expect("build");
            let parsed = parse_attachment_key(&key).expect("parse");
            assert_eq!(parsed.kind, AttachmentKind::Desc);
            assert_eq!(parsed.filename, sanitize_filename(name));
            assert_eq!(parsed.note_id, None);
        }
    }

    #[test]
    fn sanitize_blocks_path_traversal() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("dir\\file.png"), "dir_file.png");
        assert_eq!(sanitize_filename("a\0b"), "ab");
        assert_eq!(sanitize_filename("  name.png \n"), "name.png");
    }

    #[test]
    fn build_rejects_missing_note_id_and_empty_filename() {
        assert_eq!(
            build_attachment_key(AttachmentKind::Note, "a.png", None),
            Err(AttachmentError::MissingNoteId)
        );
        assert_eq!(
            build_attachment_key(AttachmentKind::Note, "a.png", Some("  ")),
            Err(AttachmentError::MissingNoteId)
        );
        assert_eq!(
            build_attachment_key(AttachmentKind::Desc, "   ", None),
            Err(AttachmentError::EmptyFilename)
        );
        assert_eq!(
            build_attachment_key(AttachmentKind::Desc, "\0", None),
            Err(AttachmentError::EmptyFilename)
        );
    }

    #[test]
    fn malformed_keys_parse_to_none() {
        for key in [
            "",
            "desc",
            "desc/",
            "desc/a/b",
            "note/only-id",
            "note//file.png",
            "note/id/file.png/extra",
            "other/file.png",
            "DESC/file.png",
            "/desc/file.png",
        ] {
            assert_eq!(parse_attachment_key(key), None, "key {key:?}");
        }
    }

    #[test]
    fn hashing_is_deterministic_and_bit_sensitive() {
        let payload = STANDARD.encode(b"hello attachments");
        let first = hash_base64_payload(&payload).expect("hash");
        assert_eq!(first, hash_base64_payload(&payload).expect("hash again"));
        assert_eq!(first.len(), 64);

        let mut flipped = b"hello attachments".to_vec();
        flipped[0] ^= 0x01;
        assert_ne!(first, hash_bytes(&flipped));
    }

    #[test]
    fn hash_matches_known_sha256_vector() {
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hash_base64_payload("data:image/png;base64,YWJj").expect("data url"),
            hash_bytes(b"abc")
        );
    }

    #[test]
    fn invalid_base64_is_reported() {
        assert!(matches!(
            hash_base64_payload("not base64!!"),
            Err(AttachmentError::InvalidPayload(_))
        ));
    }

    #[test]
    fn content_doc_ids_round_trip() {
        let hash = hash_bytes(b"same bytes");
        let id = build_content_doc_id(DEFAULT_BLOB_NAMESPACE, &hash).expect("doc id");
        assert_eq!(id, format!("blob/{hash}"));
        assert_eq!(
            parse_content_doc_id(&id),
            Some((DEFAULT_BLOB_NAMESPACE.to_string(), hash))
        );
        assert_eq!(parse_content_doc_id("blob/not-a-hash"), None);
        assert_eq!(
            build_content_doc_id("a/b", "00"),
            Err(AttachmentError::InvalidNamespace)
        );
    }

    #[test]
    fn validation_enforces_size_ceiling_and_allow_list() {
        assert_eq!(
            validate_attachment(MAX_ATTACHMENT_BYTES + 1, "image/png"),
            AttachmentValidation {
                valid: false,
                error: Some("File size exceeds 5MB limit".to_string()),
            }
        );
        assert_eq!(
            validate_attachment(MAX_ATTACHMENT_BYTES, "image/png"),
            AttachmentValidation {
                valid: true,
                error: None,
            }
        );
        assert_eq!(
            validate_attachment(0, "image/png").error.as_deref(),
            Some("Invalid file size")
        );
        assert_eq!(
            validate_attachment(-5, "application/pdf").error.as_deref(),
            Some("Invalid file size")
        );
        assert_eq!(
            validate_attachment(100, "text/html").error.as_deref(),
            Some("File type text/html is not allowed")
        );
        assert!(check_attachment(1, "application/pdf").is_ok());
    }
}
