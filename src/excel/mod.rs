//! Workbook discovery and content fingerprinting

pub mod reader;

pub use reader::{Chunk, WorkbookReader};

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Recognized spreadsheet extensions, lowercase.
pub const EXCEL_EXTENSIONS: &[&str] = &["xlsx", "xls", "xlsm", "xlsb"];

pub fn is_workbook(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXCEL_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Walk the data root and group workbook files by leaf folder.
///
/// Keys are the folder's path parts relative to the root; the BTreeMap
/// gives sorted folder order and file lists are sorted by name. Files
/// sitting directly in the root have no folder to name a table after and
/// are skipped with a warning.
pub fn discover_workbooks(root: &Path) -> Result<BTreeMap<Vec<String>, Vec<PathBuf>>> {
    let mut folders: BTreeMap<Vec<String>, Vec<PathBuf>> = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_workbook(&path) {
                let relative = path.strip_prefix(root).unwrap_or(&path);
                let parts: Vec<String> = relative
                    .parent()
                    .map(|p| {
                        p.components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect()
                    })
                    .unwrap_or_default();

                if parts.is_empty() {
                    warn!("File in data root has no folder, skipping: {}", path.display());
                    continue;
                }
                folders.entry(parts).or_default().push(path);
            }
        }
    }

    for files in folders.values_mut() {
        files.sort();
    }

    info!(
        "Discovered {} workbook files in {} folders",
        folders.values().map(Vec::len).sum::<usize>(),
        folders.len()
    );
    Ok(folders)
}

/// Streaming SHA-256 over the file bytes, hex-encoded.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_is_workbook() {
        assert!(is_workbook(Path::new("a/b/report.xlsx")));
        assert!(is_workbook(Path::new("a/b/REPORT.XLS")));
        assert!(is_workbook(Path::new("a/b/data.xlsb")));
        assert!(!is_workbook(Path::new("a/b/notes.txt")));
        assert!(!is_workbook(Path::new("a/b/noext")));
    }

    #[test]
    fn test_discover_groups_by_leaf_folder() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sales/2024")).unwrap();
        fs::create_dir_all(root.join("hr")).unwrap();
        fs::write(root.join("sales/2024/q2.xlsx"), b"x").unwrap();
        fs::write(root.join("sales/2024/q1.xlsx"), b"x").unwrap();
        fs::write(root.join("hr/staff.xls"), b"x").unwrap();
        fs::write(root.join("hr/readme.txt"), b"x").unwrap();
        fs::write(root.join("rootfile.xlsx"), b"x").unwrap();

        let folders = discover_workbooks(root).unwrap();
        assert_eq!(folders.len(), 2);

        let sales = folders
            .get(&vec!["sales".to_string(), "2024".to_string()])
            .unwrap();
        let names: Vec<_> = sales
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["q1.xlsx", "q2.xlsx"]);

        assert!(folders.contains_key(&vec!["hr".to_string()]));
    }

    #[test]
    fn test_file_hash_is_stable_and_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();

        let ha = compute_file_hash(&a).unwrap();
        let hb = compute_file_hash(&b).unwrap();
        assert_eq!(ha, hb);
        assert_eq!(ha.len(), 64);

        fs::write(&b, b"other bytes").unwrap();
        assert_ne!(compute_file_hash(&b).unwrap(), ha);
    }
}
