use std::path::Path;

use tokio::fs;

/// Context files seeded into every workflow workspace, relative to
/// `workspaceDir`. Existing files are left untouched.
pub const WORKSPACE_FILES: [(&str, &str); 11] = [
    (
        "ENTRY_POINT.md",
        "# Entry Point\n\nStart here. This file orients agents entering the workspace.\n",
    ),
    (
        "AGENTS.md",
        "# Agents\n\nRoster of agents participating in this workflow and their roles.\n",
    ),
    (
        "SPEC.md",
        "# Spec\n\nWhat this workflow is expected to produce.\n",
    ),
    (
        "DECISIONS.md",
        "# Decisions\n\nRunning log of decisions made while the workflow executes.\n",
    ),
    (
        "RUNBOOK.md",
        "# Runbook\n\nOperational notes: how to re-run, recover, and verify.\n",
    ),
    (
        "INSTRUCTIONS.md",
        "# Instructions\n\nStanding instructions that apply to every node.\n",
    ),
    (
        "README.md",
        "# Workspace\n\nWorking directory for an Undoable workflow.\n",
    ),
    (
        "infra/root-planner.md",
        "# Root Planner\n\nTop-level planning notes.\n",
    ),
    (
        "infra/subplanner.md",
        "# Subplanner\n\nPer-branch planning notes.\n",
    ),
    ("infra/worker.md", "# Worker\n\nExecution notes.\n"),
    (
        "infra/reconciler.md",
        "# Reconciler\n\nMerge and conflict-resolution notes.\n",
    ),
];

/// Ensures the workspace directory exists and seeds the fixed context-file
/// set with write-if-missing semantics.
pub async fn prepare_workspace(dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dir.join("infra")).await?;
    for (name, contents) in WORKSPACE_FILES {
        let path = dir.join(name);
        if fs::try_exists(&path).await.unwrap_or(false) {
            continue;
        }
        fs::write(&path, contents).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeds_all_files_once_and_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        prepare_workspace(dir.path()).await.unwrap();
        for (name, _) in WORKSPACE_FILES {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }

        std::fs::write(dir.path().join("SPEC.md"), "hand edited").unwrap();
        prepare_workspace(dir.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("SPEC.md")).unwrap(),
            "hand edited"
        );
    }
}
