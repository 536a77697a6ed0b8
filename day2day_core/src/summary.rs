//! Plain-text summaries of folders of persisted table bundles.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::table::TableBundle;

/// Report file name used when no output path is given.
pub const DEFAULT_REPORT: &str = "folder_summary.txt";

const SEPARATOR_WIDTH: usize = 68;

/// Summarizes every `*.json` table bundle in `dir` into a text report.
///
/// Files are visited in name order and numbered from 1; each named object
/// is listed with its column names. Files that are not bundles are
/// skipped. The report goes to `output`, or to `dir/folder_summary.txt`.
/// Returns the report path.
pub fn summarize_folder(dir: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let report_path = output.map_or_else(|| dir.join(DEFAULT_REPORT), Path::to_path_buf);

    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    files.retain(|path| {
        path.is_file()
            && path.extension().is_some_and(|ext| ext == "json")
            && *path != report_path
    });
    files.sort();

    let mut report = String::new();
    let _ = writeln!(report, "{}", "=".repeat(SEPARATOR_WIDTH));
    let _ = writeln!(report, "Folder summary: {}", dir.display());

    let mut index = 0;
    for path in &files {
        let bundle = match TableBundle::read_from(path) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unreadable bundle");
                continue;
            }
        };
        index += 1;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let _ = writeln!(report, "{index}) file: {file_name}");
        for (j, (name, table)) in bundle.objects.iter().enumerate() {
            let _ = writeln!(report, "{index}.{}) Object: {name}", j + 1);
            let _ = writeln!(report, "{}", table.names().collect::<Vec<_>>().join(" "));
        }
        debug!(file = %file_name, objects = bundle.objects.len(), "summarized bundle");
    }

    fs::write(&report_path, report)?;
    info!(path = %report_path.display(), files = index, "wrote folder summary");
    Ok(report_path)
}
