//! Single-request paths: image analysis and structured diagnosis.

use std::path::Path;

use tracing::{info, instrument, warn};

use medex_llm::{
    ChatMessage, CompletionRequest, ContentPart, LlmError, ResponseFormat, extract_json_output,
};

use crate::classifier::{self, UserType};
use crate::diagnosis::DiagnosticResponse;
use crate::image::ImageAttachment;
use crate::prompt_builder::{build_diagnosis_prompt, image_prompts};

use super::{MedexRuntime, RuntimeError};

const IMAGE_TEMPERATURE: f32 = 0.3;
const IMAGE_MAX_TOKENS: u32 = 1500;
const DIAGNOSIS_TEMPERATURE: f32 = 0.4;
const DIAGNOSIS_MAX_TOKENS: u32 = 3072;

impl MedexRuntime {
    /// Describe a medical image.  The tone follows the clinical context's
    /// user type; an empty context is treated as a patient.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn analyze_image(
        &self,
        path: impl AsRef<Path>,
        clinical_context: &str,
    ) -> Result<String, RuntimeError> {
        let image = ImageAttachment::from_path(path.as_ref()).await?;

        let user_type = if clinical_context.trim().is_empty() {
            UserType::Patient
        } else {
            classifier::detect_user_type(clinical_context)
        };
        let prompts = image_prompts(&self.config.agent.name, user_type, clinical_context);
        info!(%user_type, mime = image.mime, bytes = image.bytes.len(), "analyzing image");

        let messages = vec![
            ChatMessage::system(prompts.system),
            ChatMessage::user_parts(vec![
                ContentPart::ImageUrl { url: image.data_url() },
                ContentPart::Text { text: prompts.user },
            ]),
        ];
        let mut request = CompletionRequest::new(self.loop_config.model.clone(), messages);
        request.temperature = IMAGE_TEMPERATURE;
        request.max_tokens = IMAGE_MAX_TOKENS;

        let reply = self.complete_once(&request).await?;
        self.stats.record_image();
        Ok(reply.text())
    }

    /// Ask for a JSON diagnostic summary.  Never fails: transport or parse
    /// problems yield [`DiagnosticResponse::fallback`].
    #[instrument(skip_all)]
    pub async fn structured_diagnosis(&self, query: &str) -> DiagnosticResponse {
        let classification = classifier::classify(query);
        let messages = vec![
            ChatMessage::system(build_diagnosis_prompt(&self.config.agent.name, &classification)),
            ChatMessage::user(query),
        ];
        let mut request = CompletionRequest::new(self.loop_config.model.clone(), messages);
        request.temperature = DIAGNOSIS_TEMPERATURE;
        request.max_tokens = DIAGNOSIS_MAX_TOKENS;
        request.response_format = Some(ResponseFormat::JsonObject);

        match self.complete_once(&request).await {
            Ok(reply) => match extract_json_output::<DiagnosticResponse>(&reply.text()) {
                Some(mut diagnosis) => {
                    diagnosis.is_fallback = false;
                    diagnosis
                }
                None => {
                    warn!("structured diagnosis reply did not match the schema");
                    DiagnosticResponse::fallback(query, &classification, "respuesta sin el formato JSON esperado")
                }
            },
            Err(err) => {
                warn!(error = %err, "structured diagnosis request failed");
                DiagnosticResponse::fallback(query, &classification, &err.to_string())
            }
        }
    }

    /// One non-streaming request bounded by the round timeout.
    async fn complete_once(&self, request: &CompletionRequest) -> Result<ChatMessage, LlmError> {
        let timeout = self.loop_config.round_timeout;
        match tokio::time::timeout(timeout, self.transport.complete(request)).await {
            Ok(reply) => reply,
            Err(_) => Err(LlmError::Timeout(timeout)),
        }
    }
}
