//! Gemini `generateContent` wire types and their canonical conversions.
//!
//! Shared by the Gemini adaptor and the Gemini models on Vertex AI.

use crate::adaptor::openai::handler::finish_usage_with;
use crate::context::RelayContext;
use crate::convert::claude_stop_to_openai;
use crate::stream::reasoning::ReasoningFormat;
use crate::stream::{ChunkBuilder, ToolCallAssembler};
use crate::transport::http;
use crate::types::{
    parse_data_url, ChatCompletionsStreamResponse, CompletionTokensDetails, ContentPart, GeneralRequest, Message,
    PromptTokensDetails, Role, TextResponse, Tool, ToolChoice, Usage,
};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Harm categories relaxed on every request; Gemini's defaults block benign prompts.
const SAFETY_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_settings: Vec<SafetySetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclarations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    fn is_thought(&self) -> bool {
        self.thought == Some(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_thoughts: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub response_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Content,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub thoughts_token_count: u64,
    #[serde(default)]
    pub cached_content_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

impl UsageMetadata {
    /// Thoughts are billed as completion tokens.
    pub fn to_usage(&self) -> Usage {
        let mut usage = Usage::new(self.prompt_token_count, self.candidates_token_count + self.thoughts_token_count);
        if self.cached_content_token_count > 0 {
            usage.prompt_tokens_details = Some(PromptTokensDetails {
                cached_tokens: Some(self.cached_content_token_count),
                ..Default::default()
            });
        }
        if self.thoughts_token_count > 0 {
            usage.completion_tokens_details = Some(CompletionTokensDetails {
                reasoning_tokens: Some(self.thoughts_token_count),
                ..Default::default()
            });
        }
        usage
    }
}

/// Gemini finish reason to OpenAI finish reason.
pub fn finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => "content_filter".to_string(),
        other => claude_stop_to_openai(&other.to_ascii_lowercase()).to_string(),
    }
}

/// Inline data for an image URL; remote images are downloaded.
async fn image_part(ctx: &RelayContext, url: &str) -> Result<Part> {
    let (mime_type, data) = match parse_data_url(url) {
        Some(parsed) => parsed,
        None => http::fetch_image_base64(ctx.cancellation(), url).await?,
    };
    Ok(Part {
        inline_data: Some(InlineData { mime_type, data }),
        ..Default::default()
    })
}

/// Gemini schemas reject a handful of JSON Schema keywords.
fn clean_schema(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            map.remove("additionalProperties");
            map.remove("$schema");
            map.remove("strict");
            for v in map.values_mut() {
                clean_schema(v);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(clean_schema),
        _ => {}
    }
}

fn tool_config(choice: &ToolChoice) -> Option<Value> {
    let cfg = match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "none" => json!({"mode": "NONE"}),
            "required" | "any" => json!({"mode": "ANY"}),
            "auto" => json!({"mode": "AUTO"}),
            _ => return None,
        },
        ToolChoice::Named(named) => json!({"mode": "ANY", "allowedFunctionNames": [named.function.name]}),
    };
    Some(json!({ "functionCallingConfig": cfg }))
}

/// Canonical request to a Gemini body.
///
/// System messages become `systemInstruction`; tool results are matched to
/// the name of the call they answer, which Gemini requires.
pub async fn convert_request(ctx: &RelayContext, request: &GeneralRequest) -> Result<ChatRequest> {
    let mut call_names: HashMap<String, String> = HashMap::new();
    let mut system = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for msg in &request.messages {
        let (role, parts) = match msg.role {
            Role::System => {
                let text = msg.string_content();
                if !text.is_empty() {
                    system.push(Part::text(text));
                }
                continue;
            }
            Role::Tool => {
                let id = msg.tool_call_id.clone().unwrap_or_default();
                let name = call_names.get(&id).cloned().unwrap_or_else(|| msg.name.clone().unwrap_or(id));
                let content = msg.string_content();
                let response = serde_json::from_str::<Value>(&content)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| json!({ "content": content }));
                let part = Part {
                    function_response: Some(FunctionResponse { name, response }),
                    ..Default::default()
                };
                ("function", vec![part])
            }
            Role::User | Role::Assistant => {
                let mut parts = Vec::new();
                for part in msg.parse_content() {
                    match part {
                        ContentPart::Text { text } if !text.is_empty() => parts.push(Part::text(text)),
                        ContentPart::ImageUrl { image_url } => parts.push(image_part(ctx, &image_url.url).await?),
                        ContentPart::InputAudio { input_audio } => parts.push(Part {
                            inline_data: Some(InlineData {
                                mime_type: format!("audio/{}", input_audio.format),
                                data: input_audio.data,
                            }),
                            ..Default::default()
                        }),
                        _ => {}
                    }
                }
                for call in msg.tool_calls.iter().flatten() {
                    if let Some(id) = &call.id {
                        call_names.insert(id.clone(), call.function.name.clone());
                    }
                    let args = serde_json::from_str::<Value>(call.arguments()).unwrap_or_else(|_| json!({}));
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            name: call.function.name.clone(),
                            args,
                        }),
                        ..Default::default()
                    });
                }
                let role = if msg.role == Role::Assistant { "model" } else { "user" };
                (role, parts)
            }
        };
        if parts.is_empty() {
            continue;
        }
        // consecutive function results travel in one turn
        match contents.last_mut() {
            Some(last) if last.role == role && role == "function" => last.parts.extend(parts),
            _ => contents.push(Content {
                role: role.to_string(),
                parts,
            }),
        }
    }

    let mut generation = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        max_output_tokens: request.effective_max_tokens(),
        candidate_count: request.n.filter(|n| *n > 1),
        stop_sequences: request.stop.as_ref().map(|s| s.to_vec()).unwrap_or_default(),
        ..Default::default()
    };
    if let Some(format) = &request.response_format {
        if format.kind == "json_object" || format.kind == "json_schema" {
            generation.response_mime_type = Some("application/json".to_string());
            generation.response_schema = format
                .json_schema
                .as_ref()
                .and_then(|s| s.get("schema").cloned())
                .map(|mut s| {
                    clean_schema(&mut s);
                    s
                });
        }
    }
    if request.thinking_enabled() {
        generation.thinking_config = Some(ThinkingConfig {
            thinking_budget: request.thinking.as_ref().and_then(|t| t.budget_tokens),
            include_thoughts: Some(true),
        });
    }

    let tools = match &request.tools {
        Some(tools) if !tools.is_empty() => vec![ToolDeclarations {
            function_declarations: tools
                .iter()
                .map(|t| {
                    let mut decl = json!({ "name": t.function.name });
                    if let Some(d) = &t.function.description {
                        decl["description"] = json!(d);
                    }
                    if let Some(p) = &t.function.parameters {
                        let mut p = p.clone();
                        clean_schema(&mut p);
                        decl["parameters"] = p;
                    }
                    decl
                })
                .collect(),
        }],
        _ => Vec::new(),
    };

    Ok(ChatRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| Content {
            role: String::new(),
            parts: system,
        }),
        safety_settings: SAFETY_CATEGORIES
            .iter()
            .map(|c| SafetySetting {
                category: c.to_string(),
                threshold: "BLOCK_NONE".to_string(),
            })
            .collect(),
        generation_config: Some(generation),
        tool_config: request.tool_choice.as_ref().and_then(tool_config),
        tools,
    })
}

fn call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Text, reasoning and tool calls of one candidate.
fn split_parts(content: &Content) -> (String, String, Vec<&FunctionCall>) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut calls = Vec::new();
    for part in &content.parts {
        if let Some(call) = &part.function_call {
            calls.push(call);
        } else if let Some(t) = &part.text {
            if part.is_thought() {
                reasoning.push_str(t);
            } else {
                text.push_str(t);
            }
        }
    }
    (text, reasoning, calls)
}

/// Whole Gemini reply to an OpenAI completion.
pub fn to_text_response(resp: &ChatResponse, model: &str, format: ReasoningFormat) -> TextResponse {
    let usage = resp.usage_metadata.as_ref().map(UsageMetadata::to_usage).unwrap_or_default();
    let mut out = TextResponse::new(model, Message::assistant(""), None, usage);
    out.choices.clear();
    for (i, candidate) in resp.candidates.iter().enumerate() {
        let (text, reasoning, calls) = split_parts(&candidate.content);
        let mut message = Message::assistant(text);
        if !reasoning.is_empty() {
            format.apply(&mut message, reasoning);
        }
        let mut finish = candidate.finish_reason.as_deref().map(finish_reason);
        if !calls.is_empty() {
            message.tool_calls = Some(
                calls
                    .into_iter()
                    .map(|c| Tool::call(call_id(), c.name.clone(), c.args.to_string()))
                    .collect(),
            );
            finish = Some("tool_calls".to_string());
        }
        out.choices.push(crate::types::TextResponseChoice {
            index: i as u32,
            message,
            finish_reason: finish,
        });
    }
    out
}

/// Stateful translation of `streamGenerateContent` events.
#[derive(Debug)]
pub struct StreamTranslator {
    builder: ChunkBuilder,
    tools: ToolCallAssembler,
    usage: Option<Usage>,
    finish: Option<String>,
    pub produced: String,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>, format: ReasoningFormat) -> Self {
        Self {
            builder: ChunkBuilder::new(model, format),
            tools: ToolCallAssembler::new(),
            usage: None,
            finish: None,
            produced: String::new(),
        }
    }

    pub fn on_event(&mut self, resp: &ChatResponse) -> Vec<ChatCompletionsStreamResponse> {
        let mut chunks = Vec::new();
        if let Some(u) = &resp.usage_metadata {
            self.usage = Some(u.to_usage());
        }
        let Some(candidate) = resp.candidates.first() else {
            return chunks;
        };
        let (text, reasoning, calls) = split_parts(&candidate.content);
        if !reasoning.is_empty() {
            self.produced.push_str(&reasoning);
            chunks.push(self.builder.reasoning(reasoning));
        }
        if !text.is_empty() {
            self.produced.push_str(&text);
            chunks.push(self.builder.text(text));
        }
        if !calls.is_empty() {
            // Gemini sends each call whole, never in fragments
            let mut deltas = Vec::new();
            for call in calls {
                let args = call.args.to_string();
                self.produced.push_str(&call.name);
                self.produced.push_str(&args);
                let index = self.tools.start(call_id(), call.name.clone());
                self.tools.append_to_last(&args);
                deltas.push(Tool {
                    index: Some(index),
                    ..self.tools.calls()[index].clone()
                });
            }
            chunks.push(self.builder.tool_calls(deltas));
        }
        if let Some(reason) = &candidate.finish_reason {
            self.finish = Some(finish_reason(reason));
        }
        chunks
    }

    /// Finish and usage chunks, and the usage to bill.
    pub fn finish(&self, prompt_tokens_hint: u64) -> (Vec<ChatCompletionsStreamResponse>, Usage) {
        let reason = if self.tools.is_empty() {
            self.finish.clone().unwrap_or_else(|| "stop".to_string())
        } else {
            "tool_calls".to_string()
        };
        let usage = self.usage(prompt_tokens_hint);
        (vec![self.builder.finish(reason), self.builder.usage(usage.clone())], usage)
    }

    pub fn usage(&self, prompt_tokens_hint: u64) -> Usage {
        finish_usage_with(self.usage.clone(), prompt_tokens_hint, &self.produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Function, ResponseFormat};

    #[tokio::test]
    async fn test_request_shape() {
        let mut assistant = Message::assistant("");
        assistant.tool_calls = Some(vec![Tool::call("c1", "weather", r#"{"city":"SF"}"#)]);
        let req = GeneralRequest {
            messages: vec![
                Message::system("be brief"),
                Message::user("weather?"),
                assistant,
                Message::tool_result("c1", "72F"),
            ],
            max_tokens: Some(256),
            tools: Some(vec![Tool {
                id: None,
                tool_type: "function".into(),
                function: Function {
                    name: "weather".into(),
                    parameters: Some(json!({"type":"object","additionalProperties":false})),
                    ..Default::default()
                },
                index: None,
            }]),
            response_format: Some(ResponseFormat {
                kind: "json_object".into(),
                json_schema: None,
            }),
            ..Default::default()
        };
        let body = convert_request(&RelayContext::default(), &req).await.unwrap();
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(v["contents"][1]["role"], "model");
        assert_eq!(v["contents"][1]["parts"][0]["functionCall"]["args"]["city"], "SF");
        assert_eq!(v["contents"][2]["parts"][0]["functionResponse"]["name"], "weather");
        assert_eq!(v["contents"][2]["parts"][0]["functionResponse"]["response"]["content"], "72F");
        assert_eq!(v["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(v["generationConfig"]["responseMimeType"], "application/json");
        assert!(v["tools"][0]["functionDeclarations"][0]["parameters"]
            .get("additionalProperties")
            .is_none());
    }

    #[tokio::test]
    async fn test_data_url_becomes_inline_data() {
        let msg = Message {
            role: Role::User,
            content: Some(crate::types::MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: crate::types::ImageUrl {
                    url: "data:image/jpeg;base64,AAAA".into(),
                    detail: None,
                },
            }])),
            ..Default::default()
        };
        let req = GeneralRequest {
            messages: vec![msg],
            ..Default::default()
        };
        let body = convert_request(&RelayContext::default(), &req).await.unwrap();
        let data = body.contents[0].parts[0].inline_data.as_ref().unwrap();
        assert_eq!((data.mime_type.as_str(), data.data.as_str()), ("image/jpeg", "AAAA"));
    }

    #[test]
    fn test_reply_with_thoughts_and_calls() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "pondering", "thought": true},
                    {"functionCall": {"name": "weather", "args": {"city": "SF"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 4, "thoughtsTokenCount": 6}
        }))
        .unwrap();
        let out = to_text_response(&resp, "gemini-2.5-pro", ReasoningFormat::Unspecified);
        let choice = &out.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("pondering"));
        assert_eq!(choice.message.tool_calls.as_ref().unwrap()[0].arguments(), r#"{"city":"SF"}"#);
        assert_eq!(out.usage.completion_tokens, 10);
        assert_eq!(out.usage.total_tokens, 20);
    }

    #[test]
    fn test_stream_translation() {
        let mut t = StreamTranslator::new("gemini-2.0-flash", ReasoningFormat::Unspecified);
        let first: ChatResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}}]
        }))
        .unwrap();
        let last: ChatResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "lo"}]}, "finishReason": "MAX_TOKENS"}],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}
        }))
        .unwrap();
        assert_eq!(t.on_event(&first)[0].choices[0].delta.string_content(), "Hel");
        t.on_event(&last);
        let (chunks, usage) = t.finish(0);
        assert_eq!(chunks[0].choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (3, 2));
    }
}
