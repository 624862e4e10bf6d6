//! Knowledge-base loading for evaluator context.
//!
//! Reads every readable text file from a list of directories. Passage
//! *selection* beyond first-N truncation is an external collaborator's
//! concern; this module only loads and bounds.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

/// Load all text documents from the given directories.
///
/// Unreadable files and missing directories are logged and skipped; this
/// never fails outright.
pub fn load_knowledge_from_directories<P: AsRef<Path>>(directories: &[P]) -> Vec<String> {
    let mut documents = Vec::new();
    for directory in directories {
        let directory = directory.as_ref();
        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(_) => {
                warn!(directory = %directory.display(), "knowledge directory not found");
                continue;
            }
        };
        let mut files_loaded = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(content) => {
                    documents.push(content);
                    files_loaded += 1;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable file");
                }
            }
        }
        info!(directory = %directory.display(), files_loaded, "loaded knowledge directory");
    }
    info!(total = documents.len(), "knowledge loading complete");
    documents
}

/// Pick up to `max_passages` documents, truncated so their combined length
/// stays within `max_chars`.
pub fn select_context(documents: &[String], max_passages: usize, max_chars: usize) -> Vec<String> {
    let mut selected = Vec::new();
    let mut used = 0usize;
    for document in documents.iter().take(max_passages) {
        if used >= max_chars {
            break;
        }
        let budget = max_chars - used;
        if document.len() <= budget {
            used += document.len();
            selected.push(document.clone());
        } else {
            let mut cut = budget;
            while cut > 0 && !document.is_char_boundary(cut) {
                cut -= 1;
            }
            used += cut;
            selected.push(document[..cut].to_string());
        }
    }
    selected
}
