//! Starter template library: each template is a directory under
//! `{data_dir}/templates/<name>/` holding its files plus a `template.json`
//! describing frameworks, lifecycle commands and protected file lists.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::warn;

use crate::types::{TemplateDetails, TemplateFile};

const TEMPLATE_MANIFEST: &str = "template.json";

pub fn templates_dir(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join("templates")
}

pub fn list_templates(data_dir: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(templates_dir(data_dir)) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

/// Resolve the template for a new agent: the requested name when it exists,
/// otherwise the first available.
pub fn resolve_template(data_dir: &str, requested: Option<&str>) -> Result<TemplateDetails> {
    let available = list_templates(data_dir);
    let name = match requested {
        Some(name) if available.iter().any(|t| t == name) => name.to_string(),
        Some(name) => {
            warn!(requested = name, "unknown template, falling back to first available");
            available
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("no templates available under {data_dir}/templates"))?
        }
        None => available
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no templates available under {data_dir}/templates"))?,
    };
    load_template(data_dir, &name)
}

pub fn load_template(data_dir: &str, name: &str) -> Result<TemplateDetails> {
    let root = templates_dir(data_dir).join(name);
    let manifest_path = root.join(TEMPLATE_MANIFEST);
    let manifest = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let mut details: TemplateDetails =
        serde_json::from_str(&manifest).context("failed to parse template.json")?;
    details.name = name.to_string();

    let mut files = Vec::new();
    collect_files(&root, &root, &mut files)?;
    files.retain(|f| f.path != TEMPLATE_MANIFEST);
    files.sort_by(|a, b| a.path.cmp(&b.path));
    details.files = files;
    Ok(details)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<TemplateFile>) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read template dir {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let bytes = std::fs::read(&path)?;
        // Binary assets are not part of the generated file set.
        let Ok(contents) = String::from_utf8(bytes) else {
            continue;
        };
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        out.push(TemplateFile { path: rel, contents });
    }
    Ok(())
}
