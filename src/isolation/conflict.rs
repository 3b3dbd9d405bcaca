use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;

use crate::git::GitOps;
use crate::Result;

/// File-level overlap between two branches since their common ancestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub source: String,
    pub target: String,
    pub base: String,
    pub source_changes: BTreeSet<String>,
    pub target_changes: BTreeSet<String>,
    /// Paths changed on both sides.
    pub conflicts: Vec<String>,
}

impl ConflictReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn all_auto_resolvable(&self, extensions: &[String]) -> bool {
        self.conflicts
            .iter()
            .all(|p| is_auto_resolvable(p, extensions))
    }
}

/// Compare `source` and `target` against their merge base. Only paths in
/// both changed-file sets are conflicts.
pub fn analyze_conflicts(git: &GitOps, source: &str, target: &str) -> Result<ConflictReport> {
    let source_tip = git.branch_tip(source)?;
    let target_tip = git.branch_tip(target)?;
    let base = git.merge_base(source_tip, target_tip)?;
    let source_changes = git.changed_files(base, source_tip)?;
    let target_changes = git.changed_files(base, target_tip)?;
    let conflicts = source_changes
        .intersection(&target_changes)
        .cloned()
        .collect();
    Ok(ConflictReport {
        source: source.to_string(),
        target: target.to_string(),
        base: base.to_string(),
        source_changes,
        target_changes,
        conflicts,
    })
}

/// True only for paths whose extension is on the safelist.
pub fn is_auto_resolvable(path: &str, extensions: &[String]) -> bool {
    let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn safelist() -> Vec<String> {
        ["txt", ".md", "CSV"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_auto_resolvable_safelist() {
        assert!(is_auto_resolvable("notes.txt", &safelist()));
        assert!(is_auto_resolvable("docs/README.MD", &safelist()));
        assert!(is_auto_resolvable("data/table.csv", &safelist()));
        assert!(!is_auto_resolvable("src/main.rs", &safelist()));
        assert!(!is_auto_resolvable("Makefile", &safelist()));
        assert!(!is_auto_resolvable(".txt", &safelist()));
    }

    #[test]
    fn test_report_predicates() {
        let report = ConflictReport {
            source: "a".into(),
            target: "b".into(),
            base: "0".into(),
            source_changes: BTreeSet::new(),
            target_changes: BTreeSet::new(),
            conflicts: vec!["x.txt".into()],
        };
        assert!(!report.is_clean());
        assert!(report.all_auto_resolvable(&safelist()));
    }
}
