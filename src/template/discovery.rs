//! Priority-ordered template file discovery (spec §4.2).
//!
//! For a provider-API name `P`, files are scanned in priority order, highest
//! first: `Pinst_templates`, `Ptype_templates`, `Pprov_templates`,
//! `templates`, each tried as `.json`, `.yml`, then `.yaml`. Higher-priority
//! files override lower-priority files by `template_id`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// One discovered template file and the priority rank it was found at
/// (lower number = higher priority, matching the scan order).
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub priority: u32,
    pub objects: Vec<serde_json::Map<String, serde_json::Value>>,
}

const EXTENSIONS: &[&str] = &["json", "yml", "yaml"];

fn stem_candidates(provider_api: &str) -> Vec<String> {
    vec![
        format!("{provider_api}inst_templates"),
        format!("{provider_api}type_templates"),
        format!("{provider_api}prov_templates"),
        "templates".to_string(),
    ]
}

/// Scan `scan_dir` and `extra_paths` for template files, highest priority
/// first. Returns one [`DiscoveredFile`] per stem that resolved to an actual
/// file on disk (earlier candidates in the returned list override later
/// ones when merged by `template_id`).
pub fn discover_files(provider_api: &str, scan_dir: &Path, extra_paths: &[PathBuf]) -> Result<Vec<DiscoveredFile>> {
    let mut dirs = vec![scan_dir.to_path_buf()];
    dirs.extend(extra_paths.iter().cloned());

    let mut files = Vec::new();
    for (priority, stem) in stem_candidates(provider_api).into_iter().enumerate() {
        for dir in &dirs {
            for ext in EXTENSIONS {
                let path = dir.join(format!("{stem}.{ext}"));
                if path.is_file() {
                    let objects = parse_template_file(&path)?;
                    files.push(DiscoveredFile {
                        path,
                        priority: priority as u32,
                        objects,
                    });
                }
            }
        }
    }
    Ok(files)
}

fn parse_template_file(path: &Path) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };

    let array = value.as_array().cloned().unwrap_or_default();
    Ok(array
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect())
}

/// Merge discovered files by `templateId`/`template_id`, with lower-numbered
/// (i.e. higher-priority) files winning. Returns each winning object tagged
/// with its `source_file` and `file_priority`.
pub fn merge_by_priority(
    files: Vec<DiscoveredFile>,
) -> HashMap<String, (serde_json::Map<String, serde_json::Value>, String, u32)> {
    let mut merged: HashMap<String, (serde_json::Map<String, serde_json::Value>, String, u32)> = HashMap::new();

    for file in files {
        for object in file.objects {
            let id = object
                .get("templateId")
                .or_else(|| object.get("template_id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let Some(id) = id else { continue };

            let better = match merged.get(&id) {
                Some((_, _, existing_priority)) => file.priority < *existing_priority,
                None => true,
            };
            if better {
                merged.insert(id, (object, file.path.display().to_string(), file.priority));
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn higher_priority_file_overrides_lower_priority_by_template_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut inst = std::fs::File::create(dir.path().join("awsinst_templates.json")).unwrap();
        write!(inst, r#"[{{"templateId": "t1", "maxNumber": 9}}]"#).unwrap();
        let mut generic = std::fs::File::create(dir.path().join("templates.json")).unwrap();
        write!(generic, r#"[{{"templateId": "t1", "maxNumber": 1}}]"#).unwrap();

        let files = discover_files("aws", dir.path(), &[]).unwrap();
        let merged = merge_by_priority(files);

        assert_eq!(merged["t1"].0["maxNumber"], serde_json::json!(9));
    }

    #[test]
    fn yaml_templates_are_discovered() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("templates.yaml")).unwrap();
        write!(f, "- templateId: t1\n  maxNumber: 3\n").unwrap();

        let files = discover_files("aws", dir.path(), &[]).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].objects[0]["maxNumber"], serde_json::json!(3));
    }
}
