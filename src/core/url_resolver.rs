//! Extended URL parsing.
//!
//! An extended URL is a fetch location with an optional `:rename` suffix:
//!
//! - `https://host/file.zip`: saved as `file.zip`, unpacked
//! - `https://host/file.zip:dir/`: saved as `dir/file.zip`, unpacked
//! - `https://host/file.zip:other.zip`: saved as `other.zip`, left packed
//!
//! `dropbox://` shorthands are rewritten to direct-download links. Folder
//! shares always arrive as a zip archive.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::models::{ArchiveKind, DownloadSpec};

/// Archive name used for dropbox folder shares.
pub const DROPBOX_FOLDER_ARCHIVE: &str = "dropbox.zip";

const DROPBOX_SCHEME: &str = "dropbox://";

static DROPBOX_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^dropbox://(?:www\.dropbox\.com/)?(sh?)/([^?:]+)(?:\?[^:]*)?(:.*)?$")
        .expect("dropbox pattern is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("malformed dropbox url: {0}")]
    MalformedDropbox(String),
}

/// Resolve an extended URL into its source, destination and archive kind.
pub fn resolve(spec: &str) -> Result<DownloadSpec, ResolveError> {
    let (source, basename, rename) = if spec.starts_with(DROPBOX_SCHEME) {
        split_dropbox(spec)?
    } else {
        split_generic(spec)
    };

    let (destination, expand) = match rename {
        None => (basename, true),
        Some(dir) if dir.ends_with('/') => (join(dir, &basename), true),
        Some(file) => (file.to_string(), false),
    };

    let archive = if expand {
        ArchiveKind::infer(&destination)
    } else {
        ArchiveKind::None
    };

    Ok(DownloadSpec {
        source,
        destination,
        archive,
    })
}

/// Returns `(source, default basename, rename)` for a dropbox shorthand.
fn split_dropbox(spec: &str) -> Result<(String, String, Option<&str>), ResolveError> {
    let caps = DROPBOX_URL
        .captures(spec)
        .ok_or_else(|| ResolveError::MalformedDropbox(spec.to_string()))?;

    let (Some(kind), Some(id)) = (caps.get(1), caps.get(2)) else {
        return Err(ResolveError::MalformedDropbox(spec.to_string()));
    };
    let (kind, id) = (kind.as_str(), id.as_str());

    let basename = if kind == "s" {
        basename(id).to_string()
    } else {
        DROPBOX_FOLDER_ARCHIVE.to_string()
    };
    let rename = caps.get(3).map(|m| &m.as_str()[1..]);

    Ok((
        format!("https://www.dropbox.com/{kind}/{id}?dl=1"),
        basename,
        rename,
    ))
}

/// The rename is whatever follows the last colon, provided it is not the
/// scheme's own colon.
fn split_generic(spec: &str) -> (String, String, Option<&str>) {
    match (spec.find(':'), spec.rfind(':')) {
        (Some(first), Some(last)) if first != last => {
            let source = &spec[..last];
            (
                source.to_string(),
                basename(source).to_string(),
                Some(&spec[last + 1..]),
            )
        }
        _ => (spec.to_string(), basename(spec).to_string(), None),
    }
}

fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { "." } else { "/" };
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}
