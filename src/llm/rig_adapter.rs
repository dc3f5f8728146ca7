//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, ToolDefinition as RigToolDefinition};
use rig::message::{Message, ToolChoice};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
    ToolCall, ToolCompletionRequest, ToolCompletionResponse, ToolDefinition,
};

const PROVIDER: &str = "rig";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        force_tool: Option<&str>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<Reply, LlmError> {
        let conversation = Conversation::split(messages)?;

        let mut builder = self
            .model
            .completion_request(conversation.prompt)
            .messages(conversation.history)
            .max_tokens(u64::from(max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)));
        if let Some(preamble) = conversation.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(t) = temperature {
            builder = builder.temperature(f64::from(t));
        }
        if !tools.is_empty() {
            builder = builder.tools(tools.iter().map(rig_tool).collect());
        }
        if let Some(name) = force_tool {
            builder = builder.tool_choice(ToolChoice::Specific {
                function_names: vec![name.to_string()],
            });
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;

        let mut reply = Reply {
            input_tokens: clamp_tokens(response.usage.input_tokens),
            output_tokens: clamp_tokens(response.usage.output_tokens),
            ..Reply::default()
        };
        for content in response.choice.iter() {
            match content {
                AssistantContent::Text(text) => reply.text.push(text.text.clone()),
                AssistantContent::ToolCall(call) => reply.tool_calls.push(ToolCall {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                }),
                _ => {}
            }
        }
        Ok(reply)
    }
}

/// A chat history reshaped for rig: system turns become the preamble and
/// the last turn becomes the prompt.
struct Conversation {
    preamble: Option<String>,
    history: Vec<Message>,
    prompt: Message,
}

impl Conversation {
    fn split(messages: &[ChatMessage]) -> Result<Self, LlmError> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let mut history: Vec<Message> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match m.role {
                Role::Assistant => Message::assistant(m.content.clone()),
                _ => Message::user(m.content.clone()),
            })
            .collect();
        let prompt = history.pop().ok_or_else(|| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: "request has no user or assistant messages".to_string(),
        })?;
        Ok(Self {
            preamble: (!system.is_empty()).then(|| system.join("\n\n")),
            history,
            prompt,
        })
    }
}

#[derive(Debug, Default)]
struct Reply {
    text: Vec<String>,
    tool_calls: Vec<ToolCall>,
    input_tokens: u32,
    output_tokens: u32,
}

impl Reply {
    fn content(&self) -> Option<String> {
        (!self.text.is_empty()).then(|| self.text.join(""))
    }

    fn finish_reason(&self) -> FinishReason {
        if self.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolUse
        }
    }
}

fn rig_tool(tool: &ToolDefinition) -> RigToolDefinition {
    RigToolDefinition {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters: tool.parameters.clone(),
    }
}

fn clamp_tokens(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let reply = self
            .send(
                &request.messages,
                &[],
                None,
                request.max_tokens,
                request.temperature,
            )
            .await?;
        Ok(CompletionResponse {
            content: reply.content().unwrap_or_default(),
            input_tokens: reply.input_tokens,
            output_tokens: reply.output_tokens,
            finish_reason: reply.finish_reason(),
            response_id: None,
        })
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let reply = self
            .send(
                &request.messages,
                &request.tools,
                request.force_tool.as_deref(),
                request.max_tokens,
                request.temperature,
            )
            .await?;
        Ok(ToolCompletionResponse {
            content: reply.content(),
            finish_reason: reply.finish_reason(),
            input_tokens: reply.input_tokens,
            output_tokens: reply.output_tokens,
            tool_calls: reply.tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_turns_become_the_preamble() {
        let conversation = Conversation::split(&[
            ChatMessage::system("rules"),
            ChatMessage::user("earlier"),
            ChatMessage::assistant("noted"),
            ChatMessage::system("more rules"),
            ChatMessage::user("now"),
        ])
        .unwrap();
        assert_eq!(conversation.preamble.as_deref(), Some("rules\n\nmore rules"));
        assert_eq!(conversation.history.len(), 2);
    }

    #[test]
    fn system_only_request_is_rejected() {
        let err = Conversation::split(&[ChatMessage::system("rules")]).err();
        assert!(matches!(err, Some(LlmError::RequestFailed { .. })));
    }

    #[test]
    fn finish_reason_follows_tool_calls() {
        let mut reply = Reply {
            text: vec!["a".into(), "b".into()],
            ..Reply::default()
        };
        assert_eq!(reply.content().as_deref(), Some("ab"));
        assert_eq!(reply.finish_reason(), FinishReason::Stop);

        reply.tool_calls.push(ToolCall {
            id: "tu_1".into(),
            name: "emit_plan".into(),
            arguments: serde_json::json!({"calls": []}),
        });
        assert_eq!(reply.finish_reason(), FinishReason::ToolUse);
        assert_eq!(clamp_tokens(u64::MAX), u32::MAX);
    }
}
