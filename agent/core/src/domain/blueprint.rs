// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Blueprint Domain Model
//!
//! A blueprint describes how a category of hosted application is installed
//! and run: which runtime images are allowed, the setup script and the image
//! it runs in, start/stop command templates and the blocked-file policy.
//!
//! Blueprints are written only by the control-plane sync feed and are
//! read-only to the agent.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::domain::file_policy::FilePolicy;

const PLACEHOLDER_OPEN: &str = "{{$env::";
const PLACEHOLDER_CLOSE: &str = "}}";

/// Line appended to every setup script so the console shows a clear marker
/// when the installer ran to completion.
pub const SETUP_COMPLETION_SENTINEL: &str = "echo \"INSTALL FINISHED\"";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlueprintId(String);

impl BlueprintId {
    pub fn new(id: impl Into<String>) -> Result<Self, BlueprintError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(BlueprintError::EmptyField("blueprint id"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlueprintId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A path restricted by the blueprint, relative to the server root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedFile {
    pub path: String,
    /// Hidden from listings and search when false
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub readable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: BlueprintId,
    pub version: u64,
    /// Allowed runtime images, in order of preference
    pub images: Vec<String>,
    #[serde(default)]
    pub blocked_files: Vec<BlockedFile>,
    pub server_binary: String,
    pub start_command: String,
    #[serde(default)]
    pub stop_command: String,
    pub setup_script_base64: String,
    pub setup_image: String,
    pub setup_interpreter: String,
}

impl Blueprint {
    pub fn allows_image(&self, image: &str) -> bool {
        self.images.iter().any(|allowed| allowed == image)
    }

    /// Setup script as written into the volume, sentinel included.
    pub fn setup_script(&self) -> Result<Vec<u8>, BlueprintError> {
        let mut script = base64::engine::general_purpose::STANDARD
            .decode(self.setup_script_base64.trim())
            .map_err(|e| BlueprintError::InvalidSetupScript(e.to_string()))?;
        script.push(b'\n');
        script.extend_from_slice(SETUP_COMPLETION_SENTINEL.as_bytes());
        script.push(b'\n');
        Ok(script)
    }

    pub fn file_policy(&self) -> FilePolicy {
        FilePolicy::from_blocked_files(&self.blocked_files)
    }

    pub fn validate(&self) -> Result<(), BlueprintError> {
        if self.images.is_empty() {
            return Err(BlueprintError::EmptyField("images"));
        }
        if self.setup_image.trim().is_empty() {
            return Err(BlueprintError::EmptyField("setup_image"));
        }
        if self.setup_interpreter.trim().is_empty() {
            return Err(BlueprintError::EmptyField("setup_interpreter"));
        }
        if self.start_command.trim().is_empty() {
            return Err(BlueprintError::EmptyField("start_command"));
        }
        self.setup_script()?;
        Ok(())
    }
}

/// Values substituted into `{{$env::NAME}}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: HashMap<&'static str, String>,
}

impl TemplateVars {
    pub fn new(server_binary: &str, ram_mb: u64, port: Option<u16>) -> Self {
        let mut vars = HashMap::new();
        vars.insert("SERVER_BINARY", server_binary.to_string());
        vars.insert("SERVER_MEMORY", ram_mb.to_string());
        if let Some(port) = port {
            vars.insert("SERVER_PORT", port.to_string());
        }
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// Substitute placeholders in a command template. Unknown placeholders are
/// an error.
pub fn render_template(template: &str, vars: &TemplateVars) -> Result<String, BlueprintError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + PLACEHOLDER_OPEN.len()..];
        let end = after_open
            .find(PLACEHOLDER_CLOSE)
            .ok_or_else(|| BlueprintError::MalformedTemplate(template.to_string()))?;
        let name = after_open[..end].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| BlueprintError::UnknownPlaceholder(name.to_string()))?;
        out.push_str(value);
        rest = &after_open[end + PLACEHOLDER_CLOSE.len()..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Render a template and split it into an argv on whitespace.
pub fn render_command(template: &str, vars: &TemplateVars) -> Result<Vec<String>, BlueprintError> {
    let rendered = render_template(template, vars)?;
    let argv: Vec<String> = rendered.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(BlueprintError::EmptyField("command"));
    }
    Ok(argv)
}

#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("{0} cannot be empty")]
    EmptyField(&'static str),

    #[error("Setup script is not valid base64: {0}")]
    InvalidSetupScript(String),

    #[error("Unknown template placeholder '{0}'")]
    UnknownPlaceholder(String),

    #[error("Unterminated placeholder in template '{0}'")]
    MalformedTemplate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blueprint() -> Blueprint {
        Blueprint {
            id: BlueprintId::new("bp1").unwrap(),
            version: 1,
            images: vec!["img:java21".into(), "img:java17".into()],
            blocked_files: vec![],
            server_binary: "server.jar".into(),
            start_command: "java -Xmx{{$env::SERVER_MEMORY}}M -jar {{$env::SERVER_BINARY}} nogui".into(),
            stop_command: "stop".into(),
            setup_script_base64: base64::engine::general_purpose::STANDARD.encode("curl -o server.jar x"),
            setup_image: "img:installer".into(),
            setup_interpreter: "bash".into(),
        }
    }

    #[test]
    fn test_allows_image() {
        let bp = blueprint();
        assert!(bp.allows_image("img:java21"));
        assert!(!bp.allows_image("img:java8"));
        assert!(!bp.allows_image("img:java2"));
    }

    #[test]
    fn test_render_start_command() {
        let bp = blueprint();
        let vars = TemplateVars::new(&bp.server_binary, 1024, Some(25565));
        let argv = render_command(&bp.start_command, &vars).unwrap();
        assert_eq!(argv, vec!["java", "-Xmx1024M", "-jar", "server.jar", "nogui"]);
    }

    #[test]
    fn test_render_rejects_unknown_and_malformed_placeholders() {
        let vars = TemplateVars::new("bin", 512, None);
        assert!(matches!(
            render_template("run {{$env::SERVER_PORT}}", &vars),
            Err(BlueprintError::UnknownPlaceholder(name)) if name == "SERVER_PORT"
        ));
        assert!(matches!(
            render_template("run {{$env::SERVER_BINARY", &vars),
            Err(BlueprintError::MalformedTemplate(_))
        ));
        assert!(render_command("   ", &vars).is_err());
    }

    #[test]
    fn test_setup_script_appends_sentinel() {
        let script = blueprint().setup_script().unwrap();
        let text = String::from_utf8(script).unwrap();
        assert!(text.starts_with("curl -o server.jar x\n"));
        assert!(text.trim_end().ends_with(SETUP_COMPLETION_SENTINEL));
    }

    #[test]
    fn test_validate_rejects_bad_script() {
        let mut bp = blueprint();
        bp.setup_script_base64 = "not base64!!".into();
        assert!(matches!(bp.validate(), Err(BlueprintError::InvalidSetupScript(_))));
    }
}
