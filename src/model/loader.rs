use anyhow::{Context as AnyhowContext, Result};
use std::fs;
use std::path::Path;

use crate::model::workflow::WorkflowDefinition;

pub fn load_workflow_definition_from_yaml(file_path: &Path) -> Result<WorkflowDefinition> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path.display()))?;

    let definition: WorkflowDefinition = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize workflow definition from {}", file_path.display()))?;

    Ok(definition)
}

/// Loads every `.yaml`/`.yml` file in `dir`. Files that fail to parse abort the load.
pub fn load_workflow_definitions_from_dir(dir: &Path) -> Result<Vec<WorkflowDefinition>> {
    let mut definitions = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read definition directory {}", dir.display()))?;

    let mut paths: Vec<_> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        let is_yaml = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false);
        if is_yaml {
            definitions.push(load_workflow_definition_from_yaml(&path)?);
        }
    }

    Ok(definitions)
}
