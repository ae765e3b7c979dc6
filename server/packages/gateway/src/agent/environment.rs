use std::collections::BTreeMap;

use janus_sandbox::Sandbox;

use crate::capability::Capability;
use crate::config::AgentConfig;

/// Variables that let the agent discover its sandbox and capabilities.
pub fn build_environment(
    config: &AgentConfig,
    sandbox: &Sandbox,
    request_id: &str,
    required: &[Capability],
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let docs_dir = config.docs_dir.trim_end_matches('/');

    // Credential references first so the fixed JANUS_* names always win.
    for (name, reference) in &config.credential_refs {
        env.insert(name.clone(), reference.clone());
    }

    env.insert("JANUS_SANDBOX_ID".to_string(), sandbox.id.clone());
    env.insert(
        "JANUS_SANDBOX_URL".to_string(),
        sandbox.public_url.clone().unwrap_or_default(),
    );
    env.insert("JANUS_REQUEST_ID".to_string(), request_id.to_string());
    env.insert("JANUS_WORKSPACE".to_string(), config.workspace_dir.clone());
    env.insert("JANUS_ARTIFACT_DIR".to_string(), config.artifact_dir.clone());
    env.insert("JANUS_DOCS_DIR".to_string(), docs_dir.to_string());
    env.insert("JANUS_PROMPT_FILE".to_string(), config.prompt_path());
    env.insert(
        "JANUS_BUDGET_SECS".to_string(),
        config.budget.as_secs().to_string(),
    );
    env.insert(
        "JANUS_TOOL_TIMEOUT_SECS".to_string(),
        config.tool_timeout.as_secs().to_string(),
    );
    env.insert(
        "JANUS_EXPOSED_PORTS".to_string(),
        join(sandbox.exposed_ports.iter()),
    );

    for capability in Capability::ALL {
        let enabled = config.capabilities.contains(&capability);
        env.insert(capability.env_key().to_string(), enabled.to_string());
    }
    env.insert(
        "JANUS_CAPABILITY_DOCS".to_string(),
        config
            .capabilities
            .iter()
            .map(|capability| format!("{docs_dir}/{}", capability.doc_file()))
            .collect::<Vec<_>>()
            .join(":"),
    );
    env.insert(
        "JANUS_REQUIRED_CAPABILITIES".to_string(),
        join(required.iter().map(|capability| capability.as_str())),
    );
    env
}

fn join<T: ToString>(items: impl Iterator<Item = T>) -> String {
    items
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
