use crate::archive::paths::{check_component, sanitize_component};
use crate::error::ArchiveError;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const PARTIAL_PREFIX: &str = ".partial-";
const DEFAULT_EXTENSION: &str = "bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOutcome {
    Stored(PathBuf),
    Skipped(PathBuf),
}

/// Preferred extensions for types where the registry order is not what people expect.
fn preferred_extension(essence: &str) -> Option<&'static str> {
    Some(match essence {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "audio/aac" => "aac",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        "text/vcard" | "text/x-vcard" => "vcf",
        _ => return None,
    })
}

/// File extension for a declared MIME type; parameters such as `; codecs=opus`
/// are ignored and unknown types map to `bin`.
pub fn extension_for_mime(mime_type: &str) -> String {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence.is_empty() {
        return DEFAULT_EXTENSION.to_string();
    }
    if let Some(ext) = preferred_extension(&essence) {
        return ext.to_string();
    }
    mime_guess::get_mime_extensions_str(&essence)
        .and_then(|exts| exts.first())
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

fn file_stem_for(message_id: &str) -> Result<String, ArchiveError> {
    let stem = sanitize_component(message_id).replace(' ', "_");
    let stem = if stem.is_empty() {
        "message".to_string()
    } else {
        stem
    };
    check_component(&format!("{stem}.{DEFAULT_EXTENSION}"))?;
    Ok(stem)
}

/// Write-once attachment store keyed by message id.
#[derive(Debug, Clone, Default)]
pub struct MediaStore;

impl MediaStore {
    pub fn new() -> Self {
        Self
    }

    /// Existing blob for a message in `dir`, whatever its extension.
    pub fn existing(&self, dir: &Path, message_id: &str) -> Result<Option<PathBuf>, ArchiveError> {
        let stem = file_stem_for(message_id)?;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ArchiveError::storage(dir, err)),
        };
        for entry in entries {
            let path = entry.map_err(|err| ArchiveError::storage(dir, err))?.path();
            if path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str())
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Persist `bytes` as `<dir>/<message_id>.<ext>` unless a blob for the id is
    /// already there. Bytes go to a temp file first and are renamed into place,
    /// so an interrupted write never leaves a partial blob under the final name.
    pub fn store(
        &self,
        dir: &Path,
        message_id: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<MediaOutcome, ArchiveError> {
        if let Some(existing) = self.existing(dir, message_id)? {
            return Ok(MediaOutcome::Skipped(existing));
        }

        fs::create_dir_all(dir).map_err(|err| ArchiveError::storage(dir, err))?;
        let target = dir.join(format!(
            "{}.{}",
            file_stem_for(message_id)?,
            extension_for_mime(mime_type)
        ));

        let mut tmp = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(dir)
            .map_err(|err| ArchiveError::storage(dir, err))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|err| ArchiveError::storage(tmp.path(), err))?;

        match tmp.persist_noclobber(&target) {
            Ok(_) => Ok(MediaOutcome::Stored(target)),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                Ok(MediaOutcome::Skipped(target))
            }
            Err(err) => Err(ArchiveError::storage(&target, err.error)),
        }
    }

    /// Remove temp files left behind by an interrupted run. Returns how many were removed.
    pub fn sweep_partials(&self, media_root: &Path) -> Result<usize, ArchiveError> {
        if !media_root.exists() {
            return Ok(0);
        }
        let mut removed = 0usize;
        let mut stack = vec![media_root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(&dir).map_err(|err| ArchiveError::storage(&dir, err))?;
            for entry in entries {
                let path = entry.map_err(|err| ArchiveError::storage(&dir, err))?.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let is_partial = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(PARTIAL_PREFIX));
                if is_partial {
                    fs::remove_file(&path).map_err(|err| ArchiveError::storage(&path, err))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
