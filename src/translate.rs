use crate::config::TranslateConfig;
use crate::mapping;
use crate::models::*;
use crate::route::Action;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct TranslateError {
    pub message: String,
}

impl TranslateError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for TranslateError {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(err.to_string())
    }
}

pub fn convert_request_body(
    body: &[u8],
    action: Action,
    model: &str,
    config: &TranslateConfig,
) -> Result<Vec<u8>, TranslateError> {
    match action {
        Action::GenerateContent | Action::StreamGenerateContent => {
            let req: GenerateContentRequest = serde_json::from_slice(body)?;
            let openai_req = generate_content_to_openai(req, model, action.is_stream(), config);
            Ok(serde_json::to_vec(&openai_req)?)
        }
        Action::GenerateAnswer => Ok(body.to_vec()),
    }
}

pub fn convert_response_body(body: &[u8], action: Action) -> Result<Vec<u8>, TranslateError> {
    match action {
        Action::GenerateContent | Action::StreamGenerateContent => {
            let resp: OpenAIResponse = serde_json::from_slice(body)?;
            Ok(serde_json::to_vec(&openai_to_generate_content(resp))?)
        }
        Action::GenerateAnswer => Ok(body.to_vec()),
    }
}

pub fn generate_content_to_openai(
    req: GenerateContentRequest,
    model: &str,
    stream: bool,
    config: &TranslateConfig,
) -> OpenAIRequest {
    let messages = req
        .contents
        .into_iter()
        .flat_map(content_to_messages)
        .collect();

    let generation = req.generation_config.unwrap_or_default();
    let zero_unset = config.zero_means_unset;
    let stop = if generation.stop_sequences.is_empty() {
        None
    } else {
        Some(generation.stop_sequences)
    };

    OpenAIRequest {
        model: mapping::to_target(model).to_string(),
        messages,
        max_tokens: generation.max_output_tokens.filter(|v| !zero_unset || *v != 0),
        temperature: non_zero_float(generation.temperature, zero_unset),
        top_p: non_zero_float(generation.top_p, zero_unset),
        presence_penalty: non_zero_float(generation.presence_penalty, zero_unset),
        frequency_penalty: non_zero_float(generation.frequency_penalty, zero_unset),
        stop,
        stream,
        stream_options: stream.then_some(OpenAIStreamOptions {
            include_usage: true,
        }),
        response_format: generation
            .response_mime_type
            .as_deref()
            .and_then(mime_type_to_response_format),
    }
}

pub fn openai_to_generate_content(resp: OpenAIResponse) -> GenerateContentResponse {
    let candidates = resp
        .choices
        .into_iter()
        .map(|choice| Candidate {
            content: model_content(choice.message.content.unwrap_or_default()),
            index: choice.index,
            finish_reason: FinishReason::from_openai(choice.finish_reason.as_deref()),
        })
        .collect();

    GenerateContentResponse {
        candidates,
        usage_metadata: usage_metadata(resp.usage),
        model_version: mapping::to_source(&resp.model).to_string(),
    }
}

pub fn openai_chunk_to_generate_content(chunk: OpenAIStreamChunk) -> GenerateContentResponse {
    let candidates = chunk
        .choices
        .into_iter()
        .map(|choice| Candidate {
            content: model_content(choice.delta.content.unwrap_or_default()),
            index: choice.index,
            finish_reason: FinishReason::from_openai(choice.finish_reason.as_deref()),
        })
        .collect();

    GenerateContentResponse {
        candidates,
        usage_metadata: usage_metadata(chunk.usage),
        model_version: mapping::to_source(&chunk.model).to_string(),
    }
}

// Every part becomes its own message; parts are never concatenated.
fn content_to_messages(content: Content) -> impl Iterator<Item = OpenAIMessage> {
    let role = if content.role == "model" {
        "assistant"
    } else {
        "user"
    };
    content.parts.into_iter().map(move |part| OpenAIMessage {
        role: role.to_string(),
        content: part.text.unwrap_or_default(),
    })
}

fn non_zero_float(value: Option<f32>, zero_unset: bool) -> Option<f32> {
    value.filter(|v| !zero_unset || *v != 0.0)
}

fn mime_type_to_response_format(mime_type: &str) -> Option<OpenAIResponseFormat> {
    let format_type = match mime_type {
        "text/plain" => "text",
        "application/json" => "json_object",
        // text/x.enum has no chat-completions equivalent
        _ => return None,
    };
    Some(OpenAIResponseFormat {
        format_type: format_type.to_string(),
    })
}

fn model_content(text: String) -> Content {
    Content {
        role: "model".to_string(),
        parts: vec![Part { text: Some(text) }],
    }
}

fn usage_metadata(usage: Option<OpenAIUsage>) -> UsageMetadata {
    let usage = usage.unwrap_or_default();
    UsageMetadata {
        prompt_token_count: usage.prompt_tokens,
        candidates_token_count: usage.completion_tokens,
        total_token_count: usage.total_tokens,
    }
}
