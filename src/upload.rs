use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use multer::bytes::Bytes;

use crate::db;
use crate::errors;

/// One fully buffered file part taken from the multipart stream. Parts
/// without a filename never make it this far.
#[derive(Debug)]
pub struct Upload {
    pub original_name: String,
    pub content: Bytes,
}

/// Reduce a client-supplied filename to a safe base name: only the final
/// path component is kept, anything outside [A-Za-z0-9._-] becomes an
/// underscore, and leading dots are stripped so the result can neither
/// traverse out of the upload directory nor hide itself.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(&['/', '\\'][..]).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Derive the on-disk name `{post_id}_{sanitized}`. The post id prefix makes
/// names unique across posts; `taken` de-duplicates repeated names within a
/// single request by suffixing a counter before the extension.
pub fn stored_name(post_id: i32, original_name: &str, taken: &mut HashSet<String>) -> String {
    let base = sanitize_filename(original_name);
    let mut candidate = format!("{}_{}", post_id, base);
    let mut n = 1;
    while !taken.insert(candidate.clone()) {
        candidate = match base.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                format!("{}_{}-{}.{}", post_id, stem, n, ext)
            }
            _ => format!("{}_{}-{}", post_id, base, n),
        };
        n += 1;
    }
    candidate
}

/// Write every upload under its stored name and record the matching file
/// rows. Must run inside the same transaction that inserted the post: the
/// disk writes happen before the single commit.
pub fn persist_uploads(
    conn: &diesel::SqliteConnection,
    upload_dir: &Path,
    post_id: i32,
    uploads: &[Upload],
) -> errors::Result<Vec<String>> {
    let mut taken = HashSet::new();
    let mut stored = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let name = stored_name(post_id, &upload.original_name, &mut taken);
        let dest = upload_dir.join(&name);
        log::info!(
            "writing {} bytes to {}",
            upload.content.len(),
            dest.display()
        );
        std::fs::write(&dest, &upload.content)
            .with_context(|| format!("cannot write upload to {}", dest.display()))?;
        db::insert_file(conn, post_id, &name)?;
        stored.push(name);
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_plain_names() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("a_b-c.1.txt"), "a_b-c.1.txt");
    }

    #[test]
    fn sanitize_strips_path_components() {
        assert_eq!(sanitize_filename("/etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("c:\\users\\evil.exe"), "evil.exe");
    }

    #[test]
    fn sanitize_replaces_odd_characters() {
        assert_eq!(sanitize_filename("my report (v2).pdf"), "my_report__v2_.pdf");
        assert_eq!(sanitize_filename("naïve.txt"), "na_ve.txt");
    }

    #[test]
    fn sanitize_rejects_dotfiles_and_empty_names() {
        assert_eq!(sanitize_filename(".."), "file");
        assert_eq!(sanitize_filename(".bashrc"), "bashrc");
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("////"), "file");
    }

    #[test]
    fn stored_name_prefixes_the_post_id() {
        let mut taken = HashSet::new();
        assert_eq!(stored_name(42, "report.pdf", &mut taken), "42_report.pdf");
    }

    #[test]
    fn stored_name_suffixes_duplicates_within_a_request() {
        let mut taken = HashSet::new();
        assert_eq!(stored_name(7, "scan.png", &mut taken), "7_scan.png");
        assert_eq!(stored_name(7, "scan.png", &mut taken), "7_scan-1.png");
        assert_eq!(stored_name(7, "scan.png", &mut taken), "7_scan-2.png");
        assert_eq!(stored_name(7, "notes", &mut taken), "7_notes");
        assert_eq!(stored_name(7, "notes", &mut taken), "7_notes-1");
    }
}
