use std::collections::BTreeSet;
use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Case-insensitive set of file extensions, stored without the leading dot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionSet {
    exts: BTreeSet<String>,
}

impl ExtensionSet {
    pub fn new<I, S>(exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exts = exts
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { exts }
    }

    pub fn is_empty(&self) -> bool {
        self.exts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exts.len()
    }

    /// True if the path's final extension is in the set.
    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| self.exts.contains(&ext.to_string_lossy().to_lowercase()))
            .unwrap_or(false)
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.matches(Path::new(name))
    }
}

/// Modification time as fractional seconds since the Unix epoch.
///
/// Times before the epoch come out negative rather than failing.
pub fn mtime_secs(metadata: &Metadata) -> io::Result<f64> {
    let modified = metadata.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    })
}

/// Writes `contents` to `path` so that readers see either the old file or the
/// complete new one: sibling temp file, fsync, then rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut file = File::create(&temp_path)?;
    let written = file.write_all(contents).and_then(|_| file.sync_all());
    drop(file);
    if let Err(e) = written.and_then(|_| fs::rename(&temp_path, path)) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

pub fn format_human_elapsed(elapsed: std::time::Duration) -> String {
    let elapsed_secs = elapsed.as_secs();
    let elapsed_subsec_millis = elapsed.subsec_millis();
    if elapsed_secs >= 3600 {
        let hours = elapsed_secs / 3600;
        let minutes = (elapsed_secs % 3600) / 60;
        let seconds = elapsed_secs % 60;
        format!("{hours}:{minutes:02}:{seconds:02}.{elapsed_subsec_millis:03} (h:mm:ss.mmm)")
    } else if elapsed_secs >= 60 {
        let minutes = elapsed_secs / 60;
        let seconds = elapsed_secs % 60;
        format!("{minutes}:{seconds:02}.{elapsed_subsec_millis:03} (m:ss.mmm)")
    } else {
        format!("{}.{:03} seconds", elapsed_secs, elapsed_subsec_millis)
    }
}
