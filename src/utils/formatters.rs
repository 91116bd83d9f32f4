use std::path::Path;

/// Converts bytes to human-readable file size format
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}

/// Fixed-width text progress bar, e.g. `[#####.....]  50%`.
pub fn progress_bar(percent: u8, width: usize) -> String {
    let percent = percent.min(100);
    let filled = width * percent as usize / 100;
    format!(
        "[{}{}] {:>3}%",
        "#".repeat(filled),
        ".".repeat(width - filled),
        percent
    )
}

/// Reduce a peer-supplied name to a single safe file name.
///
/// Directory components are dropped (only the last one survives), and only
/// alphanumerics plus `.`, `-`, `_` and space are kept. Names that end up
/// empty or consisting only of dots become `"file"`.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or_default();

    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim();

    if safe.is_empty() || safe.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        safe.to_string()
    }
}

/// First path in `dir` named `name` that does not exist yet: `a.txt`,
/// then `a (1).txt`, `a (2).txt`, ...
pub fn unique_path(dir: &Path, name: &str) -> std::path::PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
