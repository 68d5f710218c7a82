use anyhow::{bail, Context, Result};
use serde_json::json;
use std::fs;
use std::path::Path;
use todo_core::attachment::{
    build_attachment_key, build_content_doc_id, hash_bytes, parse_attachment_key,
    validate_attachment, AttachmentKind,
};

pub fn build_key(kind: AttachmentKind, filename: &str, note_id: Option<&str>) -> Result<()> {
    let key = build_attachment_key(kind, filename, note_id)?;
    println!("{key}");
    Ok(())
}

pub fn parse_key(key: &str) -> Result<()> {
    let Some(parsed) = parse_attachment_key(key) else {
        bail!("invalid attachment key: {key}");
    };
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    Ok(())
}

pub fn hash_file(path: &Path, namespace: &str, content_type: Option<&str>) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let hash = hash_bytes(&bytes);
    let doc_id = build_content_doc_id(namespace, &hash)?;
    let mut report = json!({
        "hash": hash,
        "docId": doc_id,
        "size": bytes.len(),
    });
    if let Some(content_type) = content_type {
        let size = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        report["validation"] = serde_json::to_value(validate_attachment(size, content_type))?;
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub fn validate(size: i64, content_type: &str) -> Result<()> {
    let validation = validate_attachment(size, content_type);
    println!("{}", serde_json::to_string_pretty(&validation)?);
    if let Some(error) = validation.error {
        bail!(error);
    }
    Ok(())
}
