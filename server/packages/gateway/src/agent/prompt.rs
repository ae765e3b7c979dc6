use janus_completion::{ChatMessage, ContentPart, MessageContent};
use tracing::debug;

use crate::capability::Capability;

pub const REQUIRED_BLOCK_START: &str = "<<<JANUS_REQUIRED_CAPABILITIES>>>";
pub const REQUIRED_BLOCK_END: &str = "<<<END_JANUS_REQUIRED_CAPABILITIES>>>";

/// Renders the conversation into the prompt file handed to the agent.
/// Mandatory capabilities come first, fenced so the agent can't miss them.
pub fn render_prompt(
    messages: &[ChatMessage],
    required: &[Capability],
    artifact_dir: &str,
) -> String {
    let mut prompt = String::new();
    if !required.is_empty() {
        prompt.push_str(REQUIRED_BLOCK_START);
        prompt.push('\n');
        prompt.push_str(
            "The user explicitly requested the following for this turn. Each item is mandatory:\n",
        );
        for capability in required {
            prompt.push_str("- ");
            prompt.push_str(&capability.instruction(artifact_dir));
            prompt.push('\n');
        }
        prompt.push_str(REQUIRED_BLOCK_END);
        prompt.push_str("\n\n");
    }

    let last_user = messages.iter().rposition(|message| message.role == "user");
    let (history, current, trailing) = match last_user {
        Some(idx) => (&messages[..idx], Some(&messages[idx]), &messages[idx + 1..]),
        None => (messages, None, &messages[messages.len()..]),
    };
    if !history.is_empty() {
        prompt.push_str("## Conversation so far\n\n");
        push_messages(&mut prompt, history);
        if current.is_some() {
            prompt.push_str("## Current request\n\n");
        }
    }
    if let Some(current) = current {
        prompt.push_str(&render_content(&current.content));
        prompt.push('\n');
    }
    if !trailing.is_empty() {
        debug!(count = trailing.len(), "messages follow the last user turn; kept as context");
        prompt.push_str("\n## Added after the request\n\n");
        push_messages(&mut prompt, trailing);
    }
    prompt
}

fn push_messages(prompt: &mut String, messages: &[ChatMessage]) {
    for message in messages {
        prompt.push_str(&format!(
            "[{}]\n{}\n\n",
            message.role,
            render_content(&message.content)
        ));
    }
}

fn render_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.clone(),
                ContentPart::ImageUrl { image_url } => format!("[image: {}]", image_url.url),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_turn_without_flags_is_the_message_text() {
        let prompt = render_prompt(&[ChatMessage::user("plot sales")], &[], "/workspace/artifacts");
        assert_eq!(prompt, "plot sales\n");
    }

    #[test]
    fn required_capabilities_are_fenced_before_the_request() {
        let prompt = render_prompt(
            &[ChatMessage::user("draw a cat")],
            &[Capability::ImageGeneration],
            "/workspace/artifacts",
        );
        insta::assert_snapshot!(prompt.trim_end(), @r###"
        <<<JANUS_REQUIRED_CAPABILITIES>>>
        The user explicitly requested the following for this turn. Each item is mandatory:
        - You must produce at least one image file in /workspace/artifacts.
        <<<END_JANUS_REQUIRED_CAPABILITIES>>>

        draw a cat
        "###);
    }

    #[test]
    fn history_precedes_the_current_request() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::new("assistant", "hello"),
            ChatMessage::user("now chart it"),
        ];
        let prompt = render_prompt(&messages, &[], "/workspace/artifacts");
        assert!(prompt.starts_with("## Conversation so far\n\n[system]\nbe brief\n\n"));
        assert!(prompt.ends_with("## Current request\n\nnow chart it\n"));
    }

    #[test]
    fn messages_after_the_last_user_turn_are_kept() {
        let messages = vec![
            ChatMessage::user("chart revenue"),
            ChatMessage::new("assistant", "Which quarter?"),
            ChatMessage::system("answer in euros"),
        ];
        let prompt = render_prompt(&messages, &[], "/workspace/artifacts");
        assert_eq!(
            prompt,
            "chart revenue\n\n## Added after the request\n\n[assistant]\nWhich quarter?\n\n[system]\nanswer in euros\n\n"
        );
    }

    #[test]
    fn conversation_without_a_user_turn_is_all_history() {
        let messages = vec![ChatMessage::system("be brief")];
        let prompt = render_prompt(&messages, &[], "/workspace/artifacts");
        assert_eq!(prompt, "## Conversation so far\n\n[system]\nbe brief\n\n");
    }
}
