use crate::services::workers::WorkerPool;
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Feed a newline-delimited capture of payloads through the worker pool.
///
/// Blank lines are skipped; every other line is one message, malformed or not.
/// Returns the number of messages submitted.
pub fn run_file(path: &Path, pool: &WorkerPool) -> Result<usize, String> {
    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);

    let mut submitted = 0usize;
    for (index, line) in reader.split(b'\n').enumerate() {
        let mut line = line.map_err(|e| format!("failed to read {} at line {}: {}", path.display(), index + 1, e))?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        pool.submit(line)?;
        submitted += 1;
    }

    info!(
        "Replay: submitted {} message(s) from {} ({} still queued)",
        submitted,
        path.display(),
        pool.pending()
    );
    Ok(submitted)
}
