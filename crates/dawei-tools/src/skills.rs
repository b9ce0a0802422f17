// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Progressive skill loading.
//!
//! A skill is a directory holding a `SKILL.md` whose frontmatter names and
//! describes it.  Discovery only reads the frontmatter; the full instruction
//! body is loaded lazily when the model asks for one skill by name.  Roots
//! are scanned in priority order (workspace first, then the user level), and
//! a mode-specific `skills-{mode}/` directory shadows the generic `skills/`
//! one.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillScope {
    Workspace,
    System,
    User,
}

impl SkillScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillScope::Workspace => "workspace",
            SkillScope::System => "system",
            SkillScope::User => "user",
        }
    }
}

/// One discovered skill: metadata now, instructions on demand.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Path of the `SKILL.md` file.
    pub path: PathBuf,
    /// Set when the skill came from a `skills-{mode}/` directory.
    pub mode: Option<String>,
    pub scope: SkillScope,
}

impl Skill {
    /// Load the full `SKILL.md` body.
    pub fn load_content(&self) -> std::io::Result<String> {
        std::fs::read_to_string(&self.path)
    }

    /// Files living next to `SKILL.md` (templates, references, examples).
    pub fn resources(&self) -> Vec<PathBuf> {
        let Some(dir) = self.path.parent() else { return Vec::new() };
        let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| p.file_name().map(|n| n != "SKILL.md").unwrap_or(false))
            .collect();
        files.sort();
        files
    }
}

/// Parse the `SKILL.md` frontmatter:
///
/// ```text
/// ---
/// name: pdf
/// description: Work with PDF files:
///   extraction, merging, forms.
/// ---
/// ```
///
/// The description may wrap onto continuation lines; it is collapsed to a
/// single line.  Returns `None` when the frontmatter is missing or has no
/// name.
fn parse_frontmatter(content: &str) -> Option<(String, String)> {
    let mut lines = content.lines();
    if lines.next()?.trim() != "---" {
        return None;
    }

    let mut name = None;
    let mut description = String::new();
    let mut in_description = false;
    for line in lines {
        let trimmed = line.trim();
        if trimmed == "---" {
            break;
        }
        if let Some(value) = trimmed.strip_prefix("name:") {
            name = Some(value.trim().to_string());
            in_description = false;
        } else if let Some(value) = trimmed.strip_prefix("description:") {
            description = value.trim().to_string();
            in_description = true;
        } else if in_description && !trimmed.is_empty() {
            // Wrapped description continuation.
            if !description.is_empty() {
                description.push(' ');
            }
            description.push_str(trimmed);
        }
    }

    let name = name.filter(|n| !n.is_empty())?;
    Some((name, description))
}

/// Discovers and serves skills from a prioritized list of roots.
///
/// Each root is a directory containing `.dawei/skills/` (and optionally
/// `.dawei/skills-{mode}/`).  The first root is the workspace, the last the
/// user level; anything between counts as system level.
pub struct SkillManager {
    roots: Vec<PathBuf>,
    current_mode: Option<String>,
    skills: Mutex<Option<Vec<Skill>>>,
}

impl SkillManager {
    pub fn new(roots: Vec<PathBuf>, current_mode: Option<String>) -> Self {
        Self { roots, current_mode, skills: Mutex::new(None) }
    }

    fn scope_for(&self, priority: usize) -> SkillScope {
        if priority == 0 {
            SkillScope::Workspace
        } else if priority == self.roots.len() - 1 {
            SkillScope::User
        } else {
            SkillScope::System
        }
    }

    fn discover(&self) -> Vec<Skill> {
        let mut found = Vec::new();
        for (priority, root) in self.roots.iter().enumerate() {
            let scope = self.scope_for(priority);
            debug!(root = %root.display(), scope = scope.as_str(), "scanning skills root");
            discover_in_dir(&root.join(".dawei").join("skills"), None, scope, &mut found);
            if let Some(mode) = &self.current_mode {
                discover_in_dir(
                    &root.join(".dawei").join(format!("skills-{mode}")),
                    Some(mode.clone()),
                    scope,
                    &mut found,
                );
            }
        }
        info!(count = found.len(), roots = self.roots.len(), "skills discovered");
        found
    }

    /// All skills, deduplicated by name with the priority order
    /// workspace > system > user, mode-specific before generic.
    pub fn all_skills(&self, reload: bool) -> Vec<Skill> {
        let mut cache = self.skills.lock().unwrap_or_else(|e| e.into_inner());
        if reload || cache.is_none() {
            *cache = Some(self.discover());
        }
        let discovered = cache.as_deref().unwrap_or_default();

        let mode = self.current_mode.clone();
        let priorities: [(SkillScope, Option<&String>); 6] = [
            (SkillScope::Workspace, mode.as_ref()),
            (SkillScope::System, mode.as_ref()),
            (SkillScope::User, mode.as_ref()),
            (SkillScope::Workspace, None),
            (SkillScope::System, None),
            (SkillScope::User, None),
        ];

        let mut ordered: Vec<Skill> = Vec::new();
        for (scope, mode) in priorities {
            for skill in discovered {
                if skill.scope == scope
                    && skill.mode.as_ref() == mode
                    && !ordered.iter().any(|s| s.name == skill.name)
                {
                    ordered.push(skill.clone());
                }
            }
        }
        ordered
    }

    /// Keyword-overlap search over skill descriptions, best match first.
    pub fn find_matching(&self, query: &str) -> Vec<Skill> {
        let query_words: Vec<String> =
            query.to_lowercase().split_whitespace().map(String::from).collect();
        let mut scored: Vec<(Skill, usize)> = self
            .all_skills(true)
            .into_iter()
            .filter_map(|skill| {
                let haystack =
                    format!("{} {}", skill.name, skill.description).to_lowercase();
                let desc_words: Vec<&str> = haystack.split_whitespace().collect();
                let overlap =
                    query_words.iter().filter(|w| desc_words.contains(&w.as_str())).count();
                (overlap > 0).then_some((skill, overlap))
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored.into_iter().map(|(skill, _)| skill).collect()
    }

    /// Full instruction body of the highest-priority skill with this name.
    pub fn skill_content(&self, name: &str) -> Option<String> {
        let skill = self.all_skills(false).into_iter().find(|s| s.name == name)?;
        match skill.load_content() {
            Ok(content) => Some(content),
            Err(e) => {
                warn!(skill = name, path = %skill.path.display(), error = %e, "skill body read failed");
                None
            }
        }
    }

    /// Resource files of the highest-priority skill with this name.
    pub fn skill_resources(&self, name: &str) -> Vec<PathBuf> {
        self.all_skills(false)
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.resources())
            .unwrap_or_default()
    }

    /// Markdown summary of every available skill (name, scope, description).
    pub fn summary(&self) -> String {
        let skills = self.all_skills(true);
        let mut lines =
            vec![format!("# Available Skills ({})", skills.len()), String::new()];
        for skill in &skills {
            let mode = skill.mode.as_deref().map(|m| format!(" [{m}]")).unwrap_or_default();
            lines.push(format!(
                "- **{}** ({}{}): {}",
                skill.name,
                skill.scope.as_str(),
                mode,
                skill.description
            ));
        }
        lines.join("\n")
    }
}

fn discover_in_dir(
    skills_dir: &Path,
    mode: Option<String>,
    scope: SkillScope,
    found: &mut Vec<Skill>,
) {
    let Ok(entries) = std::fs::read_dir(skills_dir) else {
        debug!(dir = %skills_dir.display(), "skills directory not present");
        return;
    };
    for skill_dir in entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()) {
        let skill_file = skill_dir.join("SKILL.md");
        let Ok(text) = std::fs::read_to_string(&skill_file) else {
            debug!(dir = %skill_dir.display(), "no SKILL.md");
            continue;
        };
        let Some((name, mut description)) = parse_frontmatter(&text) else {
            warn!(file = %skill_file.display(), "invalid frontmatter, skipping skill");
            continue;
        };
        if description.is_empty() {
            description = format!("{name} skill");
        }
        // The declared name must match the directory name.
        if skill_dir.file_name().map(|d| d != name.as_str()).unwrap_or(true) {
            warn!(
                declared = %name,
                dir = %skill_dir.display(),
                "skill name does not match its directory, skipping"
            );
            continue;
        }
        found.push(Skill { name, description, path: skill_file, mode: mode.clone(), scope });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, dir: &str, name: &str, description: &str, body: &str) {
        let skill_dir = root.join(".dawei").join(dir).join(name);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            format!("---\nname: {name}\ndescription: {description}\n---\n\n{body}"),
        )
        .unwrap();
    }

    #[test]
    fn frontmatter_parses_name_and_description() {
        let content = "---\nname: pdf\ndescription: Work with PDF files\n---\n\n# PDF\n";
        let (name, description) = parse_frontmatter(content).unwrap();
        assert_eq!(name, "pdf");
        assert_eq!(description, "Work with PDF files");
    }

    #[test]
    fn frontmatter_collapses_wrapped_description() {
        let content = "---\nname: xlsx\ndescription: Spreadsheets:\n  formulas and charts.\n---\n";
        let (_, description) = parse_frontmatter(content).unwrap();
        assert_eq!(description, "Spreadsheets: formulas and charts.");
    }

    #[test]
    fn missing_frontmatter_is_rejected() {
        assert!(parse_frontmatter("# Just markdown\n").is_none());
        assert!(parse_frontmatter("---\ndescription: no name\n---\n").is_none());
    }

    #[test]
    fn discovery_reads_only_valid_skill_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "skills", "pdf", "Work with PDF files", "# PDF");
        // Name mismatch with the directory: skipped.
        let bad = dir.path().join(".dawei").join("skills").join("mismatch");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("SKILL.md"), "---\nname: other\ndescription: x\n---\n").unwrap();

        let manager = SkillManager::new(vec![dir.path().to_path_buf()], None);
        let skills = manager.all_skills(true);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "pdf");
        assert_eq!(skills[0].scope, SkillScope::Workspace);
    }

    #[test]
    fn workspace_skill_shadows_user_skill() {
        let workspace = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_skill(user.path(), "skills", "deploy", "user-level deploy", "");
        write_skill(workspace.path(), "skills", "deploy", "workspace deploy", "");

        let manager = SkillManager::new(
            vec![workspace.path().to_path_buf(), user.path().to_path_buf()],
            None,
        );
        let skills = manager.all_skills(true);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].description, "workspace deploy");
    }

    #[test]
    fn mode_specific_skill_wins_over_generic() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "skills", "review", "generic review", "");
        write_skill(dir.path(), "skills-plan", "review", "plan-mode review", "");

        let manager =
            SkillManager::new(vec![dir.path().to_path_buf()], Some("plan".to_string()));
        let skills = manager.all_skills(true);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].description, "plan-mode review");
        assert_eq!(skills[0].mode.as_deref(), Some("plan"));
    }

    #[test]
    fn skill_content_loads_full_body() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "skills", "pdf", "Work with PDF files", "## Steps\n1. open");
        let manager = SkillManager::new(vec![dir.path().to_path_buf()], None);
        let content = manager.skill_content("pdf").unwrap();
        assert!(content.contains("## Steps"));
        assert!(manager.skill_content("nope").is_none());
    }

    #[test]
    fn find_matching_ranks_by_keyword_overlap() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "skills", "pdf", "extract tables from pdf documents", "");
        write_skill(dir.path(), "skills", "email", "send email messages", "");

        let manager = SkillManager::new(vec![dir.path().to_path_buf()], None);
        let matches = manager.find_matching("extract pdf tables");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name, "pdf");
        assert!(manager.find_matching("quantum chromodynamics").is_empty());
    }

    #[test]
    fn resources_list_skips_the_skill_file() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "skills", "pdf", "pdf things", "");
        let skill_dir = dir.path().join(".dawei").join("skills").join("pdf");
        std::fs::write(skill_dir.join("template.tex"), "x").unwrap();

        let manager = SkillManager::new(vec![dir.path().to_path_buf()], None);
        let resources = manager.skill_resources("pdf");
        assert_eq!(resources.len(), 1);
        assert!(resources[0].ends_with("template.tex"));
    }

    #[test]
    fn summary_lists_every_skill() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "skills", "pdf", "pdf things", "");
        write_skill(dir.path(), "skills", "email", "mail things", "");
        let manager = SkillManager::new(vec![dir.path().to_path_buf()], None);
        let summary = manager.summary();
        assert!(summary.contains("Available Skills (2)"));
        assert!(summary.contains("**pdf** (workspace)"));
        assert!(summary.contains("**email** (workspace)"));
    }
}
