//! XDG path helpers
//!
//! - settings: `~/.config/health-voice/settings.json`
//! - kept artifacts: `~/.local/share/health-voice/artifacts/`
//! - mixer scratch files: `~/.local/share/health-voice/scratch/`

use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "health-voice";

/// Local artifacts kept after pruning
pub const MAX_KEPT_ARTIFACTS: usize = 5;

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("settings.json")
}

/// Where recordings whose upload failed are kept.
pub fn artifact_dir() -> PathBuf {
    data_dir().join("artifacts")
}

pub fn scratch_dir() -> PathBuf {
    data_dir().join("scratch")
}

/// Delete the oldest `.wav` files in `dir`, keeping the newest `keep`.
/// Returns how many were deleted.
pub fn prune_artifacts(dir: &Path, keep: usize) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "wav")
                .unwrap_or(false)
        })
        .collect();

    if entries.len() <= keep {
        return Ok(0);
    }

    // Oldest first; ties fall back to the name, which carries the timestamp
    entries.sort_by(|a, b| {
        let time_a = a.metadata().and_then(|m| m.modified()).ok();
        let time_b = b.metadata().and_then(|m| m.modified()).ok();
        time_a.cmp(&time_b).then_with(|| a.file_name().cmp(&b.file_name()))
    });

    let to_delete = entries.len() - keep;
    let mut deleted = 0;
    for entry in entries.into_iter().take(to_delete) {
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                log::debug!("Paths: pruned old artifact {:?}", entry.path());
                deleted += 1;
            }
            Err(e) => log::warn!("Paths: failed to prune {:?}: {}", entry.path(), e),
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_are_namespaced() {
        assert!(artifact_dir().ends_with("health-voice/artifacts"));
        assert!(scratch_dir().ends_with("health-voice/scratch"));
        assert!(settings_path().ends_with("health-voice/settings.json"));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..8 {
            fs::write(dir.path().join(format!("checkin_{:03}.wav", i)), b"x").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let deleted = prune_artifacts(dir.path(), MAX_KEPT_ARTIFACTS).unwrap();
        assert_eq!(deleted, 3);

        let wavs = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "wav").unwrap_or(false))
            .count();
        assert_eq!(wavs, MAX_KEPT_ARTIFACTS);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_prune_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(prune_artifacts(&dir.path().join("missing"), 5).unwrap(), 0);
    }
}
