// Boot-script template rendering and the cloud-init document that carries
// it onto a new VM. The contract with the bootstrap collaborator: every
// placeholder is substituted before the create call, and the JIT token
// value never appears in logs or the store.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::{FleetError, FleetResult};

/// Marker that delimits a placeholder on both sides.
const PLACEHOLDER_FENCE: &str = "___";

/// Path the rendered script is written to on the instance.
const SCRIPT_PATH: &str = "/start.sh";

/// Substitutions applied to the boot-script template.
#[derive(Debug, Clone)]
pub struct BootScriptParams<'a> {
    pub runner_user: &'a str,
    pub runner_group: &'a str,
    pub runner_version: &'a str,
    pub runner_checksum: &'a str,
    /// The single-use JIT config. Pass-through only: callers must not
    /// persist it, and anything logging the rendered script goes through
    /// the `SecretMasker`.
    pub jit_config: &'a str,
}

/// A boot-script template with `___NAME___` placeholders.
#[derive(Debug, Clone)]
pub struct BootScriptTemplate {
    template: String,
}

impl BootScriptTemplate {
    /// The template shipped with the controller.
    pub fn builtin() -> Self {
        Self {
            template: include_str!("../scripts/start.sh").to_string(),
        }
    }

    /// Load an operator-supplied template from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let template = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read boot script template {}", path.display()))?;
        Ok(Self { template })
    }

    #[cfg(test)]
    pub fn from_template(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Substitute every placeholder. Fails if any placeholder survives, so
    /// a template/config mismatch is caught before a VM boots with a
    /// half-rendered script.
    pub fn render(&self, params: &BootScriptParams<'_>) -> FleetResult<String> {
        let rendered = self
            .template
            .replace("___RUNNER_USER___", params.runner_user)
            .replace("___RUNNER_GROUP___", params.runner_group)
            .replace("___RUNNER_VERSION___", params.runner_version)
            .replace("___RUNNER_CHECKSUM___", params.runner_checksum)
            .replace("___JIT_CONFIG___", params.jit_config);

        let leftover = find_placeholders(&rendered);
        if !leftover.is_empty() {
            return Err(FleetError::InvalidRequest(format!(
                "boot script template has unfilled placeholders: {}",
                leftover.join(", ")
            )));
        }

        Ok(rendered)
    }
}

/// Scan for `___NAME___` tokens left in a rendered script.
fn find_placeholders(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(PLACEHOLDER_FENCE) {
        let after = &rest[start + PLACEHOLDER_FENCE.len()..];
        match after.find(PLACEHOLDER_FENCE) {
            Some(end) => {
                let name = &after[..end];
                if !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
                {
                    let token = format!("___{}___", name);
                    if !found.contains(&token) {
                        found.push(token);
                    }
                }
                rest = &after[end + PLACEHOLDER_FENCE.len()..];
            }
            None => break,
        }
    }

    found
}

// ---------------------------------------------------------------------------
// Cloud-init document
// ---------------------------------------------------------------------------

/// The `#cloud-config` document handed to the compute create call as user
/// data. It writes the rendered boot script and runs it once on first boot.
#[derive(Debug, Serialize)]
pub struct CloudConfig {
    pub write_files: Vec<WriteFile>,
    pub runcmd: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    pub permissions: String,
}

impl CloudConfig {
    /// Wrap a rendered boot script.
    pub fn for_boot_script(script: String) -> Self {
        Self {
            write_files: vec![WriteFile {
                path: SCRIPT_PATH.to_string(),
                content: script,
                permissions: "0755".to_string(),
            }],
            runcmd: vec![SCRIPT_PATH.to_string()],
        }
    }

    /// Serialize to the user-data string expected by cloud-init.
    pub fn to_user_data(&self) -> serde_yaml::Result<String> {
        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params<'a>(jit: &'a str) -> BootScriptParams<'a> {
        BootScriptParams {
            runner_user: "runner",
            runner_group: "runner",
            runner_version: "2.319.1",
            runner_checksum: "abc123",
            jit_config: jit,
        }
    }

    #[test]
    fn test_builtin_template_renders_completely() {
        let template = BootScriptTemplate::builtin();
        let script = template.render(&params("token-value")).unwrap();

        assert!(script.contains("token-value"));
        assert!(script.contains("2.319.1"));
        assert!(!script.contains(PLACEHOLDER_FENCE));
    }

    #[test]
    fn test_unfilled_placeholder_is_rejected() {
        let template = BootScriptTemplate::from_template(
            "echo ___RUNNER_USER___ ___SOMETHING_ELSE___",
        );
        let err = template.render(&params("t")).unwrap_err();

        match err {
            FleetError::InvalidRequest(msg) => {
                assert!(msg.contains("___SOMETHING_ELSE___"), "{}", msg);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_triple_underscore_in_shell_is_not_a_placeholder() {
        // Lowercase or mixed content between fences is ordinary script text.
        let template = BootScriptTemplate::from_template("echo ___not_a_placeholder___");
        assert!(template.render(&params("t")).is_ok());
    }

    #[test]
    fn test_cloud_config_document_shape() {
        let doc = CloudConfig::for_boot_script("echo hi".to_string());
        let user_data = doc.to_user_data().unwrap();

        assert!(user_data.starts_with("#cloud-config\n"));
        assert!(user_data.contains("write_files"));
        assert!(user_data.contains("/start.sh"));
        assert!(user_data.contains("runcmd"));
    }
}
