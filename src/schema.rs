use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl MessageContent {
    pub fn to_value(&self) -> Value {
        match self {
            MessageContent::Text(s) => Value::String(s.clone()),
            MessageContent::Blocks(blocks) => Value::Array(blocks.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

/// A call the model asked the caller to run, in either of the two shapes the
/// chat API has used over time.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    Tool(ToolCall),
    LegacyFunction(FunctionCall),
}

impl ToolInvocation {
    pub fn function(&self) -> &FunctionCall {
        match self {
            ToolInvocation::Tool(call) => &call.function,
            ToolInvocation::LegacyFunction(call) => call,
        }
    }
}

/// Writes invocations back onto a message object: modern calls under
/// `tool_calls`, a legacy call under `function_call`.
pub fn write_invocations(obj: &mut Map<String, Value>, calls: &[ToolInvocation]) {
    let tool_calls: Vec<Value> = calls
        .iter()
        .filter_map(|call| match call {
            ToolInvocation::Tool(tc) => serde_json::to_value(tc).ok(),
            ToolInvocation::LegacyFunction(_) => None,
        })
        .collect();
    if !tool_calls.is_empty() {
        obj.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    let legacy = calls.iter().rev().find_map(|call| match call {
        ToolInvocation::LegacyFunction(fc) => Some(fc),
        ToolInvocation::Tool(_) => None,
    });
    if let Some(fc) = legacy {
        if let Ok(value) = serde_json::to_value(fc) {
            obj.insert("function_call".to_string(), value);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<MessageContent>,
    pub name: Option<String>,
    pub calls: Vec<ToolInvocation>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("role".to_string(), Value::String(self.role.clone()));
        obj.insert(
            "content".to_string(),
            self.content
                .as_ref()
                .map(MessageContent::to_value)
                .unwrap_or(Value::Null),
        );
        if let Some(name) = &self.name {
            obj.insert("name".to_string(), Value::String(name.clone()));
        }
        write_invocations(&mut obj, &self.calls);
        if let Some(id) = &self.tool_call_id {
            obj.insert("tool_call_id".to_string(), Value::String(id.clone()));
        }
        Value::Object(obj)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

/// Schema-unified chat request. Tools are always carried in their modern
/// form; legacy `functions` have already been folded into `tools`.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub sampling: SamplingParams,
    pub tools: Option<Vec<ToolDefinition>>,
    pub tool_choice: Option<Value>,
    pub legacy_functions_mapped: bool,
    pub extra: Map<String, Value>,
}

impl CanonicalRequest {
    pub fn downstream_payload(&self) -> Value {
        let mut obj = self.extra.clone();
        obj.insert("model".to_string(), Value::String(self.model.clone()));
        obj.insert(
            "messages".to_string(),
            Value::Array(self.messages.iter().map(ChatMessage::to_value).collect()),
        );
        obj.insert("stream".to_string(), Value::Bool(self.stream));
        if let Ok(Value::Object(params)) = serde_json::to_value(&self.sampling) {
            obj.extend(params);
        }
        if let Some(tools) = &self.tools {
            obj.insert(
                "tools".to_string(),
                serde_json::to_value(tools).unwrap_or(Value::Null),
            );
        }
        if let Some(choice) = &self.tool_choice {
            obj.insert("tool_choice".to_string(), choice.clone());
        }
        Value::Object(obj)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

impl EmbeddingInput {
    pub fn joined_text(&self) -> String {
        match self {
            EmbeddingInput::Single(s) => s.clone(),
            EmbeddingInput::Batch(items) => items.join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: EmbeddingInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Name of the codec used to turn tokenized input back into text.
    #[serde(skip)]
    pub decoded_with: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Providers sometimes omit `total_tokens`.
    pub fn normalized(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
        self
    }
}

/// Non-streaming provider answer, in the OpenAI chat completion shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_calls: Option<Value>,
    #[serde(default)]
    pub function_call: Option<Value>,
}

/// One incremental piece of a streamed model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseFragment {
    pub id: String,
    pub model: String,
    pub index: u32,
    pub delta: FragmentDelta,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentDelta {
    pub role: Option<String>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub function_call: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub call_type: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionCallDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

impl ResponseFragment {
    /// Reads one `chat.completion.chunk` object. Only the first choice is
    /// consumed; chunks without choices still carry `usage`.
    pub fn from_openai_chunk(chunk: &Value) -> Result<Self, String> {
        let obj = chunk
            .as_object()
            .ok_or_else(|| "chunk must be object".to_string())?;
        let mut fragment = ResponseFragment {
            id: str_field(obj, "id").unwrap_or_default(),
            model: str_field(obj, "model").unwrap_or_default(),
            usage: obj
                .get("usage")
                .filter(|v| v.is_object())
                .and_then(|v| serde_json::from_value::<Usage>(v.clone()).ok())
                .map(Usage::normalized),
            ..Default::default()
        };

        let Some(choice) = obj
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|v| v.as_object())
        else {
            return Ok(fragment);
        };
        fragment.index = choice.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        // Some proxies send "" on every non-final chunk.
        fragment.finish_reason = str_field(choice, "finish_reason").filter(|r| !r.is_empty());

        if let Some(delta) = choice.get("delta").and_then(|v| v.as_object()) {
            fragment.delta.role = str_field(delta, "role");
            fragment.delta.content = str_field(delta, "content");
            if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for call in calls.iter().filter_map(|v| v.as_object()) {
                    let function = call.get("function").and_then(|v| v.as_object());
                    fragment.delta.tool_calls.push(ToolCallDelta {
                        index: call.get("index").and_then(|v| v.as_u64()).map(|i| i as u32),
                        id: str_field(call, "id"),
                        call_type: str_field(call, "type"),
                        name: function.and_then(|f| str_field(f, "name")),
                        arguments: function.and_then(|f| str_field(f, "arguments")),
                    });
                }
            }
            if let Some(fc) = delta.get("function_call").and_then(|v| v.as_object()) {
                fragment.delta.function_call = Some(FunctionCallDelta {
                    name: str_field(fc, "name"),
                    arguments: str_field(fc, "arguments"),
                });
            }
        }
        Ok(fragment)
    }
}

impl ToolCallDelta {
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(index) = self.index {
            obj.insert("index".to_string(), json!(index));
        }
        if let Some(id) = &self.id {
            obj.insert("id".to_string(), Value::String(id.clone()));
        }
        if let Some(call_type) = &self.call_type {
            obj.insert("type".to_string(), Value::String(call_type.clone()));
        }
        let mut function = Map::new();
        if let Some(name) = &self.name {
            function.insert("name".to_string(), Value::String(name.clone()));
        }
        if let Some(arguments) = &self.arguments {
            function.insert("arguments".to_string(), Value::String(arguments.clone()));
        }
        obj.insert("function".to_string(), Value::Object(function));
        Value::Object(obj)
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_reads_tool_call_delta_without_id() {
        let chunk = json!({
            "id": "chatcmpl-1",
            "model": "m",
            "choices": [{
                "index": 0,
                "delta": { "tool_calls": [{ "index": 0, "function": { "arguments": "{\"a\"" } }] },
                "finish_reason": null
            }]
        });
        let fragment = ResponseFragment::from_openai_chunk(&chunk).expect("fragment");
        assert_eq!(fragment.delta.tool_calls.len(), 1);
        assert_eq!(fragment.delta.tool_calls[0].id, None);
        assert_eq!(fragment.delta.tool_calls[0].index, Some(0));
        assert_eq!(
            fragment.delta.tool_calls[0].arguments.as_deref(),
            Some("{\"a\"")
        );
        assert_eq!(fragment.finish_reason, None);
    }

    #[test]
    fn usage_only_chunk_keeps_usage() {
        let chunk = json!({
            "id": "chatcmpl-1",
            "choices": [],
            "usage": { "prompt_tokens": 4, "completion_tokens": 6 }
        });
        let fragment = ResponseFragment::from_openai_chunk(&chunk).expect("fragment");
        assert_eq!(fragment.usage, Some(Usage::new(4, 6)));
    }

    #[test]
    fn empty_finish_reason_is_not_terminal() {
        let chunk = json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "delta": {"content": "a"}, "finish_reason": ""}]
        });
        let fragment = ResponseFragment::from_openai_chunk(&chunk).expect("fragment");
        assert_eq!(fragment.finish_reason, None);
        assert_eq!(fragment.delta.content.as_deref(), Some("a"));
    }

    #[test]
    fn null_content_serializes_as_null_next_to_calls() {
        let msg = ChatMessage {
            role: "assistant".to_string(),
            content: None,
            name: None,
            calls: vec![ToolInvocation::Tool(ToolCall {
                id: "call_1".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: "lookup".to_string(),
                    arguments: "{}".to_string(),
                },
            })],
            tool_call_id: None,
        };
        let value = msg.to_value();
        assert!(value["content"].is_null());
        assert_eq!(value["tool_calls"][0]["function"]["name"], "lookup");
        assert!(value.get("function_call").is_none());
    }
}
