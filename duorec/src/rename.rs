//! Deterministic rename of finished recordings.
//!
//! `YYYY-MM-DD_{project}_{pair}_{segment:02}_{themeId}_{slug}_{channel}{ext}`

use crate::error::RenameError;
use crate::store::SessionStore;
use chrono::{DateTime, Local, Utc};
use duorec_ipc::{Channel, RenameMetadata, RenameResult};
use std::io;
use std::path::Path;
use tracing::{info, warn};

const SLUG_MAX_CHARS: usize = 48;

/// Lower-cases ASCII letters and digits, collapses every other run of
/// characters into a single hyphen, trims hyphens at both ends and caps
/// the result at 48 characters. Empty results become `untitled`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut gap = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if gap && !slug.is_empty() {
                slug.push('-');
            }
            gap = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            gap = true;
        }
    }
    let slug: String = slug.chars().take(SLUG_MAX_CHARS).collect();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Explicit value first, then the recorder's file naming, then the
/// opposite of the last channel used.
///
/// The file-name heuristic matches substrings anywhere in the path, which
/// is what existing recordings rely on.
pub fn resolve_channel(requested: Option<&str>, file_path: &Path, last: Channel) -> Channel {
    if let Some(channel) = requested.and_then(Channel::parse) {
        return channel;
    }
    let lower = file_path.to_string_lossy().to_lowercase();
    if ["_mic_1", "_speaker_view", "_a"].iter().any(|s| lower.contains(s)) {
        return Channel::A;
    }
    if ["_mic_2", "_gallery_view", "_b"].iter().any(|s| lower.contains(s)) {
        return Channel::B;
    }
    last.other()
}

/// The resolved pieces of a canonical recording name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalName {
    pub date: String,
    pub project_code: String,
    pub pair_id: String,
    pub segment: u64,
    pub theme_id: String,
    pub slug: String,
    pub channel: Channel,
    /// Includes the leading dot, or empty.
    pub extension: String,
}

impl CanonicalName {
    pub fn file_name(&self) -> String {
        format!("{}{}", self.stem(), self.extension)
    }

    /// Same name with a millisecond suffix before the extension.
    pub fn unique_file_name(&self, millis: i64) -> String {
        format!("{}_{}{}", self.stem(), millis, self.extension)
    }

    fn stem(&self) -> String {
        format!(
            "{}_{}_{}_{:02}_{}_{}_{}",
            self.date,
            self.project_code,
            self.pair_id,
            self.segment,
            self.theme_id,
            self.slug,
            self.channel
        )
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Clone)]
pub struct RenamePipeline {
    store: SessionStore,
    /// Source of collision suffixes and `lastRenameAt`.
    clock: fn() -> DateTime<Utc>,
}

impl RenamePipeline {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the canonical name for `file_path` from `metadata`, falling
    /// back to the persisted record for anything not given.
    pub fn canonical_name(
        &self,
        file_path: &Path,
        metadata: &RenameMetadata,
        recorded_at: DateTime<Local>,
    ) -> CanonicalName {
        let record = self.store.get();
        let project_code = non_empty(metadata.project_code.as_deref())
            .or_else(|| non_empty(Some(record.project_code.as_str())))
            .unwrap_or_else(|| "PROJECT".to_string());
        let pair_id = non_empty(metadata.pair_id.as_deref())
            .or_else(|| non_empty(Some(record.pair_id.as_str())))
            .unwrap_or_else(|| "001".to_string());
        let segment = metadata
            .segment_counter
            .unwrap_or(record.segment_counter)
            .max(1);
        let theme_id =
            non_empty(metadata.theme_id.as_deref()).unwrap_or_else(|| "THEME".to_string());
        let theme_title = metadata.theme_title.as_deref().unwrap_or("untitled");

        CanonicalName {
            date: recorded_at.format("%Y-%m-%d").to_string(),
            project_code,
            pair_id,
            segment,
            theme_id,
            slug: slugify(theme_title),
            channel: resolve_channel(metadata.channel.as_deref(), file_path, record.last_channel),
            extension: file_path
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_default(),
        }
    }

    pub async fn rename_recording(
        &self,
        file_path: &Path,
        metadata: &RenameMetadata,
    ) -> Result<RenameResult, RenameError> {
        let absolute = std::path::absolute(file_path).unwrap_or_else(|_| file_path.to_path_buf());
        let dir = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let recorded_at = match tokio::fs::metadata(&absolute)
            .await
            .and_then(|m| m.modified())
        {
            Ok(mtime) => DateTime::<Local>::from(mtime),
            Err(e) => {
                warn!(file = %absolute.display(), "no modification time, using now: {}", e);
                Local::now()
            }
        };

        let name = self.canonical_name(&absolute, metadata, recorded_at);
        let mut new_path = dir.join(name.file_name());
        match rename_no_clobber(&absolute, &new_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let retry = dir.join(name.unique_file_name((self.clock)().timestamp_millis()));
                info!(dest = %new_path.display(), "destination exists, retrying as {}", retry.display());
                rename_no_clobber(&absolute, &retry)
                    .await
                    .map_err(|source| RenameError::Io {
                        from: absolute.clone(),
                        to: retry.clone(),
                        source,
                    })?;
                new_path = retry;
            }
            Err(source) => {
                return Err(RenameError::Io {
                    from: absolute,
                    to: new_path,
                    source,
                })
            }
        }

        let updated_config = self.store.update(|r| {
            r.last_channel = name.channel;
            r.last_rename_at = Some((self.clock)().to_rfc3339());
            r.project_code = name.project_code.clone();
            r.pair_id = name.pair_id.clone();
        })?;
        info!(file = %new_path.display(), "recording renamed");

        Ok(RenameResult {
            new_path,
            updated_config,
        })
    }
}

/// `rename`, except an existing destination is reported as
/// `AlreadyExists` instead of being replaced.
async fn rename_no_clobber(from: &Path, to: &Path) -> io::Result<()> {
    if tokio::fs::try_exists(to).await? {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }
    tokio::fs::rename(from, to).await
}
