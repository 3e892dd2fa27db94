//! Bridge from rig-core completion models to `LlmProvider`.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, CompletionRequestBuilder, Message};

use crate::error::ModelError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider, Role};

pub struct RigAdapter<M: CompletionModel> {
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

    fn join_role(&self, request: &CompletionRequest, role: Role) -> String {
        request
            .messages
            .iter()
            .filter(|m| m.role == role)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
impl<M: CompletionModel> LlmProvider for RigAdapter<M> {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ModelError> {
        let preamble = self.join_role(&request, Role::System);
        let prompt = self.join_role(&request, Role::User);

        let mut builder = CompletionRequestBuilder::new(self.model.clone(), Message::user(prompt))
            .temperature(request.temperature);
        if !preamble.is_empty() {
            builder = builder.preamble(preamble);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        let response = self
            .model
            .completion(builder.build())
            .await
            .map_err(|e| ModelError::RequestFailed {
                provider: self.model_name.clone(),
                reason: e.to_string(),
            })?;

        let content: String = response
            .choice
            .into_iter()
            .filter_map(|part| match part {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(ModelError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "empty completion".to_string(),
            });
        }
        Ok(CompletionResponse { content })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
