//! Output path planner.
//!
//! Expands the operator's output template against item metadata, sanitizes
//! the result, resolves collisions with the configured duplicate policy, and
//! hands the downloader a final path plus its `.part` sibling. The planner
//! creates directories but never the file itself.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::options::DuplicatePolicy;

/// Characters replaced with `-` inside any expanded placeholder value.
const INVALID_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Extension of the temporary download file.
pub const PART_SUFFIX: &str = ".part";

/// Metadata available to template expansion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathMeta {
    pub title: String,
    pub id: String,
    pub ext: String,
    pub quality: String,
    pub artist: String,
    pub album: String,
    pub playlist_title: String,
    pub playlist_id: String,
    pub index: Option<u32>,
    pub count: Option<u32>,
}

/// Result of planning: where bytes land and where they are staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPath {
    pub abs_dir: PathBuf,
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
}

/// Sanitize one expanded placeholder value for use inside a path segment.
pub fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if INVALID_CHARS.contains(&c) || c.is_control() {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    out
}

fn lookup(meta: &PathMeta, key: &str) -> Option<String> {
    let value = match key {
        "title" => meta.title.clone(),
        "id" => meta.id.clone(),
        "ext" => meta.ext.clone(),
        "quality" => meta.quality.clone(),
        "artist" => meta.artist.clone(),
        "album" => meta.album.clone(),
        "playlist_title" | "playlist-title" => meta.playlist_title.clone(),
        "playlist_id" | "playlist-id" => meta.playlist_id.clone(),
        "index" => meta.index.map(|i| i.to_string()).unwrap_or_default(),
        "count" => meta.count.map(|c| c.to_string()).unwrap_or_default(),
        _ => return None,
    };
    Some(sanitize_component(&value))
}

/// Expand `{placeholder}` tokens. Unknown placeholders are kept literal;
/// placeholder values are sanitized at substitution time so a `/` in a
/// title cannot introduce a path separator.
fn expand_template(template: &str, meta: &PathMeta) -> String {
    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match lookup(meta, key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                // Unterminated brace, keep literal.
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand and normalize a template into a relative path.
///
/// Segments are trimmed of leading/trailing whitespace and dots, empty
/// segments are elided (which also collapses consecutive separators), and
/// absolute or root-escaping templates are rejected.
pub fn expand_relative(template: &str, meta: &PathMeta) -> Result<PathBuf, DownloadError> {
    let expanded = expand_template(template, meta);

    if expanded.starts_with('/') || expanded.starts_with('\\') {
        return Err(DownloadError::PathEscape { path: expanded });
    }

    let mut segments: Vec<String> = Vec::new();
    for raw in expanded.split('/') {
        if raw == ".." {
            return Err(DownloadError::PathEscape { path: expanded });
        }
        let trimmed = raw
            .trim_matches(|c: char| c.is_whitespace() || c == '.')
            .to_string();
        if !trimmed.is_empty() {
            segments.push(trimmed);
        }
    }

    if segments.is_empty() {
        return Err(DownloadError::PathEscape { path: expanded });
    }

    Ok(segments.iter().collect())
}

fn with_rename_suffix(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let renamed = match path.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    path.with_file_name(renamed)
}

/// Find the first free ` (n)`-suffixed sibling of `path`, starting at 2.
fn next_free_name(path: &Path) -> PathBuf {
    let mut n = 2;
    loop {
        let candidate = with_rename_suffix(path, n);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Expand, sanitize, and resolve duplicates for one item.
///
/// On success the intermediate directories exist and `temp_path` names the
/// `.part` sibling the downloader will open. `DuplicateSkipped` and
/// `PromptRequired` are non-fatal signals handled by the runner.
pub fn plan(
    template: &str,
    meta: &PathMeta,
    output_root: &Path,
    policy: DuplicatePolicy,
) -> Result<PlannedPath, DownloadError> {
    let relative = expand_relative(template, meta)?;
    let mut final_path = output_root.join(&relative);

    if final_path.exists() {
        match policy {
            DuplicatePolicy::Skip => {
                return Err(DownloadError::DuplicateSkipped {
                    path: final_path.to_string_lossy().into_owned(),
                });
            }
            DuplicatePolicy::Prompt => {
                return Err(DownloadError::PromptRequired {
                    path: final_path.to_string_lossy().into_owned(),
                });
            }
            DuplicatePolicy::Rename => {
                final_path = next_free_name(&final_path);
            }
            DuplicatePolicy::Overwrite => {}
        }
    }

    let abs_dir = final_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| output_root.to_path_buf());
    create_dirs(&abs_dir)?;

    let temp_path = part_path(&final_path);
    Ok(PlannedPath {
        abs_dir,
        final_path,
        temp_path,
    })
}

/// Plan with an operator-chosen file name replacing the templated one
/// (the `rename(custom)` prompt resolution).
pub fn plan_renamed(
    template: &str,
    meta: &PathMeta,
    output_root: &Path,
    new_name: &str,
) -> Result<PlannedPath, DownloadError> {
    let relative = expand_relative(template, meta)?;
    let dir = relative.parent().map(Path::to_path_buf).unwrap_or_default();
    let file = sanitize_component(new_name);
    let trimmed = file.trim_matches(|c: char| c.is_whitespace() || c == '.');
    if trimmed.is_empty() {
        return Err(DownloadError::PathEscape {
            path: new_name.to_string(),
        });
    }

    let final_path = output_root.join(dir).join(trimmed);
    let abs_dir = final_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| output_root.to_path_buf());
    create_dirs(&abs_dir)?;

    let temp_path = part_path(&final_path);
    Ok(PlannedPath {
        abs_dir,
        final_path,
        temp_path,
    })
}

/// `.part` sibling of a final path.
pub fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(PART_SUFFIX);
    final_path.with_file_name(name)
}

#[cfg(unix)]
fn create_dirs(dir: &Path) -> Result<(), DownloadError> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dirs(dir: &Path) -> Result<(), DownloadError> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn meta() -> PathMeta {
        PathMeta {
            title: "A Great Video".to_string(),
            id: "vid123".to_string(),
            ext: "mp4".to_string(),
            quality: "720p".to_string(),
            artist: "Some Artist".to_string(),
            album: "Some Album".to_string(),
            playlist_title: "Mix".to_string(),
            playlist_id: "PL9".to_string(),
            index: Some(3),
            count: Some(12),
        }
    }

    #[test]
    fn expands_basic_template() {
        let path = expand_relative("{title}.{ext}", &meta()).unwrap();
        assert_eq!(path, PathBuf::from("A Great Video.mp4"));
    }

    #[test]
    fn expands_playlist_placeholders_both_spellings() {
        let a = expand_relative("{playlist_title}/{index} - {title}.{ext}", &meta()).unwrap();
        let b = expand_relative("{playlist-title}/{index} - {title}.{ext}", &meta()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, PathBuf::from("Mix/3 - A Great Video.mp4"));
    }

    #[test]
    fn sanitizes_hostile_title() {
        let mut m = meta();
        m.title = "a/b\\c:d*e?f\"g<h>i|j".to_string();
        let path = expand_relative("{title}.{ext}", &m).unwrap();
        assert_eq!(path, PathBuf::from("a-b-c-d-e-f-g-h-i-j.mp4"));
    }

    #[test]
    fn missing_metadata_collapses_separators() {
        let mut m = meta();
        m.artist = String::new();
        let path = expand_relative("{artist}/{title}.{ext}", &m).unwrap();
        // Empty artist segment is elided instead of leaving a bare slash.
        assert_eq!(path, PathBuf::from("A Great Video.mp4"));
    }

    #[test]
    fn rejects_absolute_and_escaping_templates() {
        assert!(matches!(
            expand_relative("/etc/{title}", &meta()),
            Err(DownloadError::PathEscape { .. })
        ));
        assert!(matches!(
            expand_relative("../{title}.{ext}", &meta()),
            Err(DownloadError::PathEscape { .. })
        ));
        assert!(matches!(
            expand_relative("a/../../{title}", &meta()),
            Err(DownloadError::PathEscape { .. })
        ));
    }

    #[test]
    fn dotdot_inside_title_is_neutralized() {
        let mut m = meta();
        m.title = "..".to_string();
        // A bare `..` segment is rejected outright; with an extension the
        // dots are trimmed away and only the extension survives.
        assert!(expand_relative("{title}", &m).is_err());
        assert_eq!(expand_relative("{title}.{ext}", &m).unwrap(), PathBuf::from("mp4"));
    }

    #[test]
    fn unknown_placeholder_is_literal() {
        let path = expand_relative("{bogus}-{id}.{ext}", &meta()).unwrap();
        assert_eq!(path, PathBuf::from("{bogus}-vid123.mp4"));
    }

    #[test]
    fn plan_skip_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("A Great Video.mp4");
        std::fs::write(&existing, b"x").unwrap();

        for _ in 0..2 {
            let err = plan("{title}.{ext}", &meta(), dir.path(), DuplicatePolicy::Skip)
                .unwrap_err();
            assert!(matches!(err, DownloadError::DuplicateSkipped { .. }));
        }
    }

    #[test]
    fn plan_prompt_raises_prompt_required() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("A Great Video.mp4"), b"x").unwrap();
        let err = plan("{title}.{ext}", &meta(), dir.path(), DuplicatePolicy::Prompt)
            .unwrap_err();
        match err {
            DownloadError::PromptRequired { path } => assert!(path.ends_with("A Great Video.mp4")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn plan_rename_appends_counter_before_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("A Great Video.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("A Great Video (2).mp4"), b"x").unwrap();

        let planned = plan("{title}.{ext}", &meta(), dir.path(), DuplicatePolicy::Rename).unwrap();
        assert_eq!(
            planned.final_path.file_name().unwrap().to_str().unwrap(),
            "A Great Video (3).mp4"
        );
        assert_eq!(
            planned.temp_path.file_name().unwrap().to_str().unwrap(),
            "A Great Video (3).mp4.part"
        );
    }

    #[test]
    fn plan_creates_intermediate_directories() {
        let dir = tempfile::tempdir().unwrap();
        let planned = plan(
            "{playlist_title}/{title}.{ext}",
            &meta(),
            dir.path(),
            DuplicatePolicy::Overwrite,
        )
        .unwrap();
        assert!(planned.abs_dir.is_dir());
        assert_eq!(planned.abs_dir, dir.path().join("Mix"));
    }

    #[test]
    fn plan_renamed_honors_custom_name() {
        let dir = tempfile::tempdir().unwrap();
        let planned = plan_renamed("{title}.{ext}", &meta(), dir.path(), "My Pick.mp4").unwrap();
        assert_eq!(planned.final_path, dir.path().join("My Pick.mp4"));
    }

    proptest! {
        #[test]
        fn expanded_paths_are_relative_and_clean(title in ".*", artist in ".*") {
            let m = PathMeta {
                title,
                artist,
                ext: "mp4".to_string(),
                ..PathMeta::default()
            };
            match expand_relative("{artist}/{title}.{ext}", &m) {
                Ok(path) => {
                    prop_assert!(path.is_relative());
                    for segment in path.iter() {
                        let s = segment.to_string_lossy();
                        prop_assert!(!s.is_empty());
                        prop_assert_ne!(&*s, "..");
                        for c in ['\\', ':', '*', '?', '"', '<', '>', '|'] {
                            prop_assert!(!s.contains(c));
                        }
                    }
                }
                // Only the escape guard may reject.
                Err(DownloadError::PathEscape { .. }) => {}
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }
    }
}
