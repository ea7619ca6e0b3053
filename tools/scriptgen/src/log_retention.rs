use crate::errors::ProxyError;
use std::fs;
use std::path::{Path, PathBuf};

/// The live log plus this many rotated files share the disk budget.
pub const LOG_GENERATIONS: u64 = 4;

/// Size at which the live log is rotated for a given budget.
pub fn rotation_threshold(budget_bytes: u64) -> u64 {
    (budget_bytes / LOG_GENERATIONS).max(1)
}

/// Renames the live log to `<stem>.<stamp>-<n>.<ext>` next to it and returns
/// the new path. The live path is free afterwards.
pub fn rotate(live: &Path, stamp_ms: u128) -> Result<PathBuf, ProxyError> {
    let (dir, stem, ext) = split_log_path(live)?;
    let mut seq = 0u32;
    let target = loop {
        let candidate = dir.join(rotated_name(&stem, ext.as_deref(), stamp_ms, seq));
        if !candidate.exists() {
            break candidate;
        }
        seq += 1;
    };
    fs::rename(live, &target).map_err(|e| ProxyError::Io(e.to_string()))?;
    Ok(target)
}

/// Rotated copies of `live`, oldest first. Nothing else in the directory is
/// listed, so user files that happen to live there are never candidates.
pub fn rotated_siblings(live: &Path) -> Result<Vec<PathBuf>, ProxyError> {
    let (dir, stem, ext) = split_log_path(live)?;
    let mut files = fs::read_dir(&dir)
        .map_err(|e| ProxyError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| is_rotated_name(name, &stem, ext.as_deref()))
        })
        .collect::<Vec<_>>();
    files.sort_by(|a, b| {
        let modified = |path: &Path| fs::metadata(path).ok().and_then(|m| m.modified().ok());
        modified(a).cmp(&modified(b)).then_with(|| a.cmp(b))
    });
    Ok(files)
}

/// Deletes the oldest rotated copies of `live` until the live log and its
/// rotations fit the budget. The live log itself is never removed.
pub fn enforce_total_budget(live: &Path, budget_bytes: u64) -> Result<Vec<PathBuf>, ProxyError> {
    let rotated = rotated_siblings(live)?;
    let size = |path: &Path| fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let mut total = size(live) + rotated.iter().map(|path| size(path)).sum::<u64>();

    let mut deleted = Vec::new();
    for path in rotated {
        if total <= budget_bytes {
            break;
        }
        let len = size(&path);
        fs::remove_file(&path).map_err(|e| ProxyError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }
    Ok(deleted)
}

fn split_log_path(live: &Path) -> Result<(PathBuf, String, Option<String>), ProxyError> {
    let stem = live
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| ProxyError::Io(format!("log path has no file name: {}", live.display())))?;
    let ext = live
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_string);
    let dir = match live.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, stem.to_string(), ext))
}

fn rotated_name(stem: &str, ext: Option<&str>, stamp_ms: u128, seq: u32) -> String {
    match ext {
        Some(ext) => format!("{stem}.{stamp_ms}-{seq:04}.{ext}"),
        None => format!("{stem}.{stamp_ms}-{seq:04}"),
    }
}

fn is_rotated_name(name: &str, stem: &str, ext: Option<&str>) -> bool {
    let Some(rest) = name.strip_prefix(stem).and_then(|rest| rest.strip_prefix('.')) else {
        return false;
    };
    let tag = match ext {
        Some(ext) => match rest.strip_suffix(ext).and_then(|tag| tag.strip_suffix('.')) {
            Some(tag) => tag,
            None => return false,
        },
        None => rest,
    };
    !tag.is_empty() && tag.bytes().all(|b| b.is_ascii_digit() || b == b'-')
}
