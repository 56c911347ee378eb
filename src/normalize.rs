//! Inbound request normalization.
//!
//! Chat requests arrive in several overlapping shapes: plain string content or
//! multi-modal content blocks, `tool_calls` or the older `function_call`, and
//! `tools`/`tool_choice` or the older `functions`/`function_call` pair. Every
//! variant is folded into a [`CanonicalRequest`] here, before any other code
//! looks at it.

use crate::config::UnknownFieldPolicy;
use crate::error::GatewayError;
use crate::schema::{
    CanonicalRequest, ChatMessage, EmbeddingInput, EmbeddingRequest, FunctionCall,
    FunctionDefinition, MessageContent, SamplingParams, ToolCall, ToolDefinition, ToolInvocation,
};
use serde_json::{Map, Value, json};
use tiktoken_rs::CoreBPE;

const KNOWN_CHAT_FIELDS: [&str; 16] = [
    "model",
    "messages",
    "stream",
    "temperature",
    "top_p",
    "max_tokens",
    "max_completion_tokens",
    "frequency_penalty",
    "presence_penalty",
    "stop",
    "n",
    "user",
    "tools",
    "tool_choice",
    "functions",
    "function_call",
];

const MESSAGE_ROLES: [&str; 6] = ["system", "developer", "user", "assistant", "tool", "function"];

pub fn normalize_chat_request(
    body: &Value,
    unknown_fields: UnknownFieldPolicy,
) -> Result<CanonicalRequest, GatewayError> {
    let obj = body
        .as_object()
        .ok_or_else(|| GatewayError::validation("request body must be a JSON object"))?;

    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::invalid_param("model", "model must not be empty"))?
        .to_string();

    let raw_messages = obj
        .get("messages")
        .and_then(|v| v.as_array())
        .filter(|arr| !arr.is_empty())
        .ok_or_else(|| GatewayError::invalid_param("messages", "messages must not be empty"))?;
    let messages = raw_messages
        .iter()
        .enumerate()
        .map(|(i, raw)| normalize_message(i, raw))
        .collect::<Result<Vec<_>, _>>()?;

    let stream = match obj.get("stream") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(GatewayError::invalid_param("stream", "stream must be a boolean")),
    };

    let sampling = parse_sampling(obj)?;

    let mut tools = match obj.get("tools") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(parse_tool_definitions(raw, "tools")?),
    };
    let mut tool_choice = match obj.get("tool_choice") {
        None | Some(Value::Null) => None,
        Some(v @ (Value::String(_) | Value::Object(_))) => Some(v.clone()),
        Some(_) => {
            return Err(GatewayError::invalid_param(
                "tool_choice",
                "tool_choice must be a string or an object",
            ));
        }
    };

    let mut legacy_functions_mapped = false;
    if tools.is_none() && tool_choice.is_none() {
        if let Some(raw) = obj.get("functions").filter(|v| !v.is_null()) {
            tools = Some(parse_legacy_functions(raw)?);
            legacy_functions_mapped = true;
        }
        if let Some(raw) = obj.get("function_call").filter(|v| !v.is_null()) {
            tool_choice = Some(map_legacy_function_choice(raw)?);
            legacy_functions_mapped = true;
        }
    } else if obj.contains_key("functions") || obj.contains_key("function_call") {
        tracing::debug!("dropping legacy functions in favour of tools");
    }

    let mut extra = Map::new();
    for (key, value) in obj {
        if KNOWN_CHAT_FIELDS.contains(&key.as_str()) {
            continue;
        }
        match unknown_fields {
            UnknownFieldPolicy::Reject => {
                return Err(GatewayError::invalid_param(
                    key.clone(),
                    format!("unknown field: {key}"),
                ));
            }
            UnknownFieldPolicy::Ignore => {}
            UnknownFieldPolicy::Preserve => {
                extra.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(CanonicalRequest {
        model,
        messages,
        stream,
        sampling,
        tools,
        tool_choice,
        legacy_functions_mapped,
        extra,
    })
}

fn normalize_message(position: usize, raw: &Value) -> Result<ChatMessage, GatewayError> {
    let param = format!("messages[{position}]");
    let obj = raw
        .as_object()
        .ok_or_else(|| GatewayError::invalid_param(param.clone(), "message must be an object"))?;

    let role = obj
        .get("role")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::invalid_param(format!("{param}.role"), "role is required"))?;
    if !MESSAGE_ROLES.contains(&role) {
        return Err(GatewayError::invalid_param(
            format!("{param}.role"),
            format!("unsupported role: {role}"),
        ));
    }

    let content = match obj.get("content") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(MessageContent::Text(s.clone())),
        Some(Value::Array(blocks)) => Some(MessageContent::Blocks(blocks.clone())),
        Some(_) => {
            return Err(GatewayError::invalid_param(
                format!("{param}.content"),
                "content must be a string or an array of content blocks",
            ));
        }
    };

    let calls = parse_invocations(obj.get("tool_calls"), obj.get("function_call"))
        .map_err(|err| GatewayError::invalid_param(param.clone(), err))?;

    if content.is_none() && calls.is_empty() {
        return Err(GatewayError::invalid_param(
            format!("{param}.content"),
            "content may only be null when tool_calls or function_call is present",
        ));
    }

    Ok(ChatMessage {
        role: role.to_string(),
        content,
        name: obj.get("name").and_then(|v| v.as_str()).map(|s| s.to_string()),
        calls,
        tool_call_id: obj
            .get("tool_call_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

/// The one place tool calls are read. Both the `tool_calls` array and a
/// legacy `function_call` object come out as [`ToolInvocation`]s; arguments
/// that are not already a string are re-encoded as JSON text.
pub fn parse_invocations(
    tool_calls: Option<&Value>,
    function_call: Option<&Value>,
) -> Result<Vec<ToolInvocation>, String> {
    let mut out = Vec::new();
    match tool_calls {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                let call = item
                    .as_object()
                    .ok_or_else(|| format!("tool_calls[{i}] must be an object"))?;
                let id = call
                    .get("id")
                    .or_else(|| call.get("call_id"))
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| format!("tool_calls[{i}] is missing id"))?;
                let call_type = call
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("function");
                let function = call
                    .get("function")
                    .ok_or_else(|| format!("tool_calls[{i}] is missing function"))?;
                out.push(ToolInvocation::Tool(ToolCall {
                    id: id.to_string(),
                    call_type: call_type.to_string(),
                    function: parse_function_call(function)
                        .map_err(|err| format!("tool_calls[{i}].function: {err}"))?,
                }));
            }
        }
        Some(_) => return Err("tool_calls must be an array".to_string()),
    }
    match function_call {
        None | Some(Value::Null) => {}
        Some(raw) => out.push(ToolInvocation::LegacyFunction(
            parse_function_call(raw).map_err(|err| format!("function_call: {err}"))?,
        )),
    }
    Ok(out)
}

fn parse_function_call(raw: &Value) -> Result<FunctionCall, String> {
    let obj = raw.as_object().ok_or_else(|| "must be an object".to_string())?;
    let name = obj
        .get("name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing name".to_string())?;
    let arguments = match obj.get("arguments") {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => serde_json::to_string(other).map_err(|err| err.to_string())?,
    };
    Ok(FunctionCall {
        name: name.to_string(),
        arguments,
    })
}

fn parse_tool_definitions(raw: &Value, param: &str) -> Result<Vec<ToolDefinition>, GatewayError> {
    let items = raw
        .as_array()
        .ok_or_else(|| GatewayError::invalid_param(param, "tools must be an array"))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            parse_tool_definition(item)
                .map_err(|err| GatewayError::invalid_param(format!("{param}[{i}]"), err))
        })
        .collect()
}

fn parse_tool_definition(raw: &Value) -> Result<ToolDefinition, String> {
    let obj = raw
        .as_object()
        .ok_or_else(|| "tool definition must be an object".to_string())?;
    let tool_type = obj
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("function");
    if tool_type != "function" {
        return Err(format!("unsupported tool type: {tool_type}"));
    }
    // Flat definitions put the function fields next to `type`.
    let function = match obj.get("function") {
        Some(Value::Object(f)) => f,
        Some(_) => return Err("function must be an object".to_string()),
        None => obj,
    };
    Ok(ToolDefinition {
        tool_type: tool_type.to_string(),
        function: parse_function_definition(function)?,
    })
}

fn parse_function_definition(obj: &Map<String, Value>) -> Result<FunctionDefinition, String> {
    let name = obj
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "function name is required".to_string())?;
    let parameters = match obj.get("parameters") {
        None | Some(Value::Null) => None,
        Some(v @ Value::Object(_)) => Some(v.clone()),
        Some(_) => return Err("function parameters must be an object".to_string()),
    };
    Ok(FunctionDefinition {
        name: name.to_string(),
        description: obj
            .get("description")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        parameters,
        strict: obj.get("strict").and_then(|v| v.as_bool()),
    })
}

fn parse_legacy_functions(raw: &Value) -> Result<Vec<ToolDefinition>, GatewayError> {
    let items = raw
        .as_array()
        .ok_or_else(|| GatewayError::invalid_param("functions", "functions must be an array"))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_object()
                .ok_or_else(|| "function definition must be an object".to_string())
                .and_then(parse_function_definition)
                .map(|function| ToolDefinition {
                    tool_type: "function".to_string(),
                    function,
                })
                .map_err(|err| GatewayError::invalid_param(format!("functions[{i}]"), err))
        })
        .collect()
}

fn map_legacy_function_choice(raw: &Value) -> Result<Value, GatewayError> {
    match raw {
        Value::String(mode) if mode == "auto" || mode == "none" => Ok(raw.clone()),
        Value::Object(obj) => {
            let name = obj
                .get("name")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    GatewayError::invalid_param("function_call", "function_call.name is required")
                })?;
            Ok(json!({ "type": "function", "function": { "name": name } }))
        }
        _ => Err(GatewayError::invalid_param(
            "function_call",
            "function_call must be \"auto\", \"none\" or {\"name\": ...}",
        )),
    }
}

fn parse_sampling(obj: &Map<String, Value>) -> Result<SamplingParams, GatewayError> {
    Ok(SamplingParams {
        temperature: bounded_f64(obj, "temperature", 0.0, 2.0)?,
        top_p: bounded_f64(obj, "top_p", 0.0, 1.0)?,
        max_tokens: match obj
            .get("max_tokens")
            .filter(|v| !v.is_null())
            .or_else(|| obj.get("max_completion_tokens").filter(|v| !v.is_null()))
        {
            None => None,
            Some(v) => Some(v.as_u64().filter(|n| *n > 0).ok_or_else(|| {
                GatewayError::invalid_param("max_tokens", "max_tokens must be a positive integer")
            })?),
        },
        frequency_penalty: bounded_f64(obj, "frequency_penalty", -2.0, 2.0)?,
        presence_penalty: bounded_f64(obj, "presence_penalty", -2.0, 2.0)?,
        stop: match obj.get("stop") {
            None | Some(Value::Null) => None,
            Some(v @ Value::String(_)) => Some(v.clone()),
            Some(Value::Array(items)) if items.iter().all(|i| i.is_string()) => {
                Some(Value::Array(items.clone()))
            }
            Some(_) => {
                return Err(GatewayError::invalid_param(
                    "stop",
                    "stop must be a string or an array of strings",
                ));
            }
        },
        n: match obj.get("n").filter(|v| !v.is_null()) {
            None => None,
            Some(v) => Some(v.as_u64().filter(|n| (1..=10).contains(n)).ok_or_else(|| {
                GatewayError::invalid_param("n", "n must be an integer between 1 and 10")
            })?),
        },
        user: obj.get("user").and_then(|v| v.as_str()).map(|s| s.to_string()),
    })
}

fn bounded_f64(
    obj: &Map<String, Value>,
    key: &str,
    min: f64,
    max: f64,
) -> Result<Option<f64>, GatewayError> {
    match obj.get(key).filter(|v| !v.is_null()) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|x| (min..=max).contains(x))
            .map(Some)
            .ok_or_else(|| {
                GatewayError::invalid_param(key, format!("{key} must be between {min} and {max}"))
            }),
    }
}

/// Text view of message content, used for logging and token estimation only.
pub fn flatten_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(s) => s.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(flatten_block)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn flatten_block(block: &Value) -> String {
    if let Some(s) = block.as_str() {
        return s.to_string();
    }
    if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    if let Some(url) = image_url(block) {
        return format!("[image:{url}]");
    }
    serde_json::to_string(block).unwrap_or_default()
}

fn image_url(block: &Value) -> Option<&str> {
    let is_image = block
        .get("type")
        .and_then(|v| v.as_str())
        .map(|t| t.starts_with("image"))
        .unwrap_or(false)
        || block.get("image_url").is_some();
    if !is_image {
        return None;
    }
    block
        .get("image_url")
        .and_then(|v| v.get("url").and_then(|u| u.as_str()).or_else(|| v.as_str()))
        .or_else(|| block.get("url").and_then(|v| v.as_str()))
}

/// Flattened text of every input message, joined with newlines.
pub fn request_input_text(req: &CanonicalRequest) -> String {
    req.messages
        .iter()
        .filter_map(|m| m.content.as_ref().map(flatten_content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn normalize_embedding_request(body: &Value) -> Result<EmbeddingRequest, GatewayError> {
    let obj = body
        .as_object()
        .ok_or_else(|| GatewayError::validation("request body must be a JSON object"))?;
    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::invalid_param("model", "model must not be empty"))?
        .to_string();

    let raw_input = obj
        .get("input")
        .filter(|v| !v.is_null())
        .ok_or_else(|| GatewayError::invalid_param("input", "input is required"))?;
    let (input, decoded_with) = match classify_embedding_input(raw_input) {
        Some(RawEmbeddingInput::Text(input)) => (input, None),
        Some(RawEmbeddingInput::Tokens { sequences, nested }) => {
            let (codec, texts) = decode_token_sequences(&sequences)
                .ok_or_else(|| token_input_error(&model))?;
            tracing::warn!(codec, "embedding input was tokenized; decoded before forwarding");
            let input = if nested {
                EmbeddingInput::Batch(texts)
            } else {
                EmbeddingInput::Single(texts.into_iter().next().unwrap_or_default())
            };
            (input, Some(codec))
        }
        None => {
            return Err(GatewayError::invalid_param(
                "input",
                "input must be a string or an array of strings",
            ));
        }
    };

    let encoding_format = match obj.get("encoding_format") {
        None | Some(Value::Null) => None,
        Some(Value::String(f)) if f == "float" || f == "base64" => Some(f.clone()),
        Some(_) => {
            return Err(GatewayError::invalid_param(
                "encoding_format",
                "encoding_format must be 'float' or 'base64'",
            ));
        }
    };
    let dimensions = match obj.get("dimensions").filter(|v| !v.is_null()) {
        None => None,
        Some(v) => Some(v.as_u64().filter(|d| *d > 0).ok_or_else(|| {
            GatewayError::invalid_param("dimensions", "dimensions must be a positive integer")
        })?),
    };

    Ok(EmbeddingRequest {
        model,
        input,
        encoding_format,
        dimensions,
        user: obj.get("user").and_then(|v| v.as_str()).map(|s| s.to_string()),
        decoded_with,
    })
}

enum RawEmbeddingInput {
    Text(EmbeddingInput),
    Tokens { sequences: Vec<Vec<u64>>, nested: bool },
}

fn classify_embedding_input(raw: &Value) -> Option<RawEmbeddingInput> {
    match raw {
        Value::String(s) => Some(RawEmbeddingInput::Text(EmbeddingInput::Single(s.clone()))),
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) if items.iter().all(|v| v.is_string()) => {
            Some(RawEmbeddingInput::Text(EmbeddingInput::Batch(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
            )))
        }
        Value::Array(items) if items.iter().all(|v| v.is_u64()) => {
            Some(RawEmbeddingInput::Tokens {
                sequences: vec![items.iter().filter_map(|v| v.as_u64()).collect()],
                nested: false,
            })
        }
        Value::Array(items) => {
            let sequences = items
                .iter()
                .map(|item| {
                    let ids = item.as_array().filter(|a| !a.is_empty())?;
                    ids.iter().map(|v| v.as_u64()).collect::<Option<Vec<u64>>>()
                })
                .collect::<Option<Vec<_>>>()?;
            Some(RawEmbeddingInput::Tokens {
                sequences,
                nested: true,
            })
        }
        _ => None,
    }
}

struct TokenCodec {
    name: &'static str,
    /// Exclusive upper bound of the codec's token ids, specials included.
    vocab_limit: u64,
    bpe: fn() -> &'static CoreBPE,
}

const TOKEN_CODECS: [TokenCodec; 4] = [
    TokenCodec {
        name: "o200k_base",
        vocab_limit: 200_019,
        bpe: tiktoken_rs::o200k_base_singleton,
    },
    TokenCodec {
        name: "cl100k_base",
        vocab_limit: 100_277,
        bpe: tiktoken_rs::cl100k_base_singleton,
    },
    TokenCodec {
        name: "p50k_base",
        vocab_limit: 50_281,
        bpe: tiktoken_rs::p50k_base_singleton,
    },
    TokenCodec {
        name: "r50k_base",
        vocab_limit: 50_257,
        bpe: tiktoken_rs::r50k_base_singleton,
    },
];

/// Tries each codec in turn; the first that turns every sequence into valid
/// UTF-8 wins.
fn decode_token_sequences(sequences: &[Vec<u64>]) -> Option<(&'static str, Vec<String>)> {
    let max_id = sequences.iter().flatten().copied().max()?;
    for codec in TOKEN_CODECS.iter() {
        if max_id >= codec.vocab_limit {
            continue;
        }
        let bpe = (codec.bpe)();
        let decoded = sequences
            .iter()
            .map(|seq| {
                let ranks: Vec<u32> = seq.iter().map(|&t| t as u32).collect();
                bpe.decode(ranks).ok().filter(|text| !text.is_empty())
            })
            .collect::<Option<Vec<String>>>();
        if let Some(texts) = decoded {
            return Some((codec.name, texts));
        }
    }
    None
}

fn token_input_error(model: &str) -> GatewayError {
    GatewayError::Validation {
        message: "input looks like a list of token ids that could not be decoded; \
                  send the original text instead, e.g. {\"input\": \"your text\"} or \
                  {\"input\": [\"first text\", \"second text\"]}"
            .to_string(),
        param: Some("input".to_string()),
        examples: Some(json!([
            { "model": model, "input": "The food was delicious and the waiter was friendly." },
            { "model": model, "input": ["first document", "second document"] }
        ])),
    }
}
