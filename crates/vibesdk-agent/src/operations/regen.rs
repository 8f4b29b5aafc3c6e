//! Self-repair operations: per-file regeneration, the fast smart fixer,
//! and the pure deterministic fixer.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use vibesdk_core::types::{AnalysisIssue, FileState};

use super::{extract_json, files_block, issues_block, GeneratedFile, OperationContext};
use crate::inference::InferenceMessage;

const REGEN_SYSTEM: &str = "You regenerate a single broken file of a generated web project. \
Return JSON {path, purpose, contents} with the complete corrected file. Return only JSON.";

const FAST_FIX_SYSTEM: &str = "You are a fast code fixer. Given the project files and the \
current runtime/static-analysis issues, return JSON {files: [{path, purpose, contents}]} \
containing only the files you changed, each with complete new contents. Return only JSON.";

/// Regenerate one file. `retry_index` climbs with each caller attempt and
/// is surfaced to the model so later attempts try a different approach.
pub async fn regenerate_file(
    ctx: &OperationContext,
    file: &FileState,
    retry_index: u32,
) -> Result<GeneratedFile> {
    let prompt = format!(
        "File to regenerate (attempt {}):\n--- {} ({})\n{}\n\nLast diff:\n{}\n\nCurrent issues:\n{}",
        retry_index + 1,
        file.file_path,
        file.file_purpose,
        file.file_contents,
        file.last_diff,
        issues_block(&ctx.runtime_errors, &ctx.static_analysis),
    );
    let raw = ctx
        .inference
        .infer(vec![InferenceMessage::system(REGEN_SYSTEM), InferenceMessage::user(prompt)])
        .await?;
    extract_json::<GeneratedFile>(&raw).context("file regeneration did not parse")
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FastFixOutput {
    files: Vec<GeneratedFile>,
}

/// One LLM pass over all relevant files and current issues; returns only
/// changed files.
pub async fn fast_smart_fix(ctx: &OperationContext) -> Result<Vec<GeneratedFile>> {
    let prompt = format!(
        "Current issues:\n{}\n\nProject files:\n{}",
        issues_block(&ctx.runtime_errors, &ctx.static_analysis),
        files_block(&ctx.relevant_files),
    );
    let raw = ctx
        .inference
        .infer(vec![InferenceMessage::system(FAST_FIX_SYSTEM), InferenceMessage::user(prompt)])
        .await?;
    Ok(extract_json::<FastFixOutput>(&raw)
        .context("fast fix output did not parse")?
        .files)
}

// ── Deterministic (pure) fixes ───────────────────────────────────────────

/// Modules that TS2307 reports as missing, minus workspace-internal ones.
/// These are fed to `bun install`.
pub fn missing_modules_from_issues(issues: &[AnalysisIssue]) -> Vec<String> {
    let Ok(re) = Regex::new(r"Cannot find module '([^']+)'") else {
        return Vec::new();
    };
    let mut modules: Vec<String> = Vec::new();
    for issue in issues.iter().filter(|i| i.code == "TS2307") {
        for cap in re.captures_iter(&issue.message) {
            let module = cap[1].to_string();
            if module.starts_with("@shared") || module.starts_with('.') {
                continue;
            }
            // Subpath imports install the package root.
            let root = package_root(&module);
            if !modules.contains(&root) {
                modules.push(root);
            }
        }
    }
    modules
}

fn package_root(module: &str) -> String {
    let mut parts = module.split('/');
    match module.starts_with('@') {
        true => {
            let scope = parts.next().unwrap_or_default();
            let name = parts.next().unwrap_or_default();
            format!("{scope}/{name}")
        }
        false => parts.next().unwrap_or(module).to_string(),
    }
}

/// Pure fixer over typecheck issues. Currently removes import lines the
/// checker flags as unused (TS6133/TS6192); anything needing judgment is
/// left to the smart fixer. Returns only modified files.
pub fn deterministic_fix(files: &[FileState], issues: &[AnalysisIssue]) -> Vec<GeneratedFile> {
    let mut fixed = Vec::new();
    for file in files {
        let dead_lines: Vec<u32> = issues
            .iter()
            .filter(|i| i.file == file.file_path)
            .filter(|i| i.code == "TS6133" || i.code == "TS6192")
            .map(|i| i.line)
            .collect();
        if dead_lines.is_empty() {
            continue;
        }
        let mut changed = false;
        let kept: Vec<&str> = file
            .file_contents
            .lines()
            .enumerate()
            .filter(|(idx, line)| {
                let line_no = (*idx + 1) as u32;
                let drop = dead_lines.contains(&line_no) && line.trim_start().starts_with("import ");
                if drop {
                    changed = true;
                }
                !drop
            })
            .map(|(_, line)| line)
            .collect();
        if changed {
            let mut contents = kept.join("\n");
            if file.file_contents.ends_with('\n') {
                contents.push('\n');
            }
            fixed.push(GeneratedFile {
                path: file.file_path.clone(),
                purpose: file.file_purpose.clone(),
                contents,
            });
        }
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(file: &str, line: u32, code: &str, message: &str) -> AnalysisIssue {
        AnalysisIssue {
            file: file.into(),
            line,
            column: 1,
            code: code.into(),
            message: message.into(),
            severity: "error".into(),
        }
    }

    #[test]
    fn missing_modules_are_parsed_and_filtered() {
        let issues = vec![
            issue("a.ts", 1, "TS2307", "Cannot find module 'left-pad' or its type declarations."),
            issue("a.ts", 2, "TS2307", "Cannot find module '@shared/util'"),
            issue("a.ts", 3, "TS2307", "Cannot find module './local'"),
            issue("b.ts", 1, "TS2307", "Cannot find module '@tanstack/react-query/devtools'"),
            issue("c.ts", 9, "TS2551", "Property 'foo' does not exist"),
        ];
        let modules = missing_modules_from_issues(&issues);
        assert_eq!(modules, vec!["left-pad".to_string(), "@tanstack/react-query".to_string()]);
    }

    #[test]
    fn deterministic_fix_strips_flagged_import_lines() {
        let file = FileState {
            file_path: "src/App.tsx".into(),
            file_contents: "import { unused } from 'x';\nimport { used } from 'y';\nused();\n".into(),
            file_purpose: String::new(),
            last_diff: String::new(),
        };
        let issues = vec![issue("src/App.tsx", 1, "TS6133", "'unused' is declared but never read")];
        let fixed = deterministic_fix(&[file], &issues);
        assert_eq!(fixed.len(), 1);
        assert!(!fixed[0].contents.contains("unused"));
        assert!(fixed[0].contents.contains("import { used }"));
    }

    #[test]
    fn deterministic_fix_ignores_non_import_lines() {
        let file = FileState {
            file_path: "src/a.ts".into(),
            file_contents: "const x = 1;\n".into(),
            file_purpose: String::new(),
            last_diff: String::new(),
        };
        let issues = vec![issue("src/a.ts", 1, "TS6133", "'x' is declared but never read")];
        assert!(deterministic_fix(&[file], &issues).is_empty());
    }
}
