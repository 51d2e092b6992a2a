// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Blueprint store commands
//!
//! Commands: import, list

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hearth_core::application::repository_factory::{create_blueprint_repository, open_database};
use hearth_core::domain::blueprint::Blueprint;
use hearth_core::domain::node_config::NodeConfigManifest;
use hearth_core::domain::repository::{BlueprintRepository, StorageBackend};

#[derive(Subcommand)]
pub enum BlueprintCommand {
    /// Upsert blueprint documents (YAML or JSON) into the local store
    Import {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// List blueprints in the local store
    List,
}

pub async fn handle_command(command: BlueprintCommand, config_override: Option<PathBuf>) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;
    let backend = StorageBackend::from_url(&config.spec.database.url);
    if backend == StorageBackend::InMemory {
        anyhow::bail!("database.url is 'memory'; imported blueprints would be lost on exit");
    }

    let database = open_database(&backend)
        .await
        .context("Failed to open blueprint store")?;
    let store = create_blueprint_repository(&backend, database.as_ref())?;

    match command {
        BlueprintCommand::Import { files } => import(store, &files).await,
        BlueprintCommand::List => list(store).await,
    }
}

/// Parse one blueprint document; `.json` files are read as JSON, anything
/// else as YAML.
pub fn parse_blueprint_file(path: &Path) -> Result<Blueprint> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let blueprint: Blueprint = if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {} as JSON", path.display()))?
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {} as YAML", path.display()))?
    };

    blueprint
        .validate()
        .with_context(|| format!("Blueprint in {} is invalid", path.display()))?;
    Ok(blueprint)
}

async fn import(store: Arc<dyn BlueprintRepository>, files: &[PathBuf]) -> Result<()> {
    for path in files {
        let blueprint = parse_blueprint_file(path)?;
        let written = store
            .upsert(&blueprint)
            .await
            .with_context(|| format!("Failed to store blueprint {}", blueprint.id))?;

        if written {
            println!(
                "{}",
                format!("✓ {} v{} stored", blueprint.id, blueprint.version).green()
            );
        } else {
            println!(
                "{} v{} unchanged (store already holds this or a newer version)",
                blueprint.id, blueprint.version
            );
        }
    }
    Ok(())
}

async fn list(store: Arc<dyn BlueprintRepository>) -> Result<()> {
    let blueprints = store.list_all().await.context("Failed to list blueprints")?;
    if blueprints.is_empty() {
        println!("{}", "No blueprints stored".dimmed());
        return Ok(());
    }

    for blueprint in blueprints {
        println!("{} v{}", blueprint.id.to_string().bold(), blueprint.version);
        println!("  Images: {}", blueprint.images.join(", "));
        println!("  Setup: {} in {}", blueprint.setup_interpreter, blueprint.setup_image);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAPER: &str = r#"
id: paper
version: 4
images: ["ghcr.io/hearth/java:21"]
blocked_files:
  - path: /server.properties
    visible: true
    readable: true
server_binary: server.jar
start_command: "java -Xmx{{$env::SERVER_MEMORY}}M -jar {{$env::SERVER_BINARY}} nogui"
stop_command: stop
setup_script_base64: Y3VybCAtbyBzZXJ2ZXIuamFyIGh0dHBzOi8vZXhhbXBsZS5jb20=
setup_image: alpine:3
setup_interpreter: ash
"#;

    #[test]
    fn test_parse_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("paper.yaml");
        std::fs::write(&yaml, PAPER).unwrap();
        let from_yaml = parse_blueprint_file(&yaml).unwrap();
        assert_eq!(from_yaml.version, 4);
        assert_eq!(from_yaml.blocked_files.len(), 1);

        let json = dir.path().join("paper.json");
        std::fs::write(&json, serde_json::to_string(&from_yaml).unwrap()).unwrap();
        assert_eq!(parse_blueprint_file(&json).unwrap(), from_yaml);
    }

    #[test]
    fn test_parse_rejects_invalid_blueprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, PAPER.replace("images: [\"ghcr.io/hearth/java:21\"]", "images: []")).unwrap();
        assert!(parse_blueprint_file(&path).is_err());
    }
}
