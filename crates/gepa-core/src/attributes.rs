//! Attribute derivation - raw, provider-specific attribute bags to a normalized view
//!
//! Instrumentation libraries spell the same fact many ways (`gen_ai.usage.input_tokens`,
//! `llm.token_count.prompt`, `ai.usage.promptTokens`, ...). Each derived field owns an
//! ordered probe list; the first probe whose path exists and whose parser accepts the
//! value wins. Anything unparseable degrades to `None`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum length of a prompt summary synthesized from the first user message
const SUMMARY_MAX_CHARS: usize = 200;

/// One chat message of the prompt sent to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// Normalized fields shared by spans and telemetry records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedAttributes {
    pub model_id: Option<String>,
    pub provider: Option<String>,
    pub aggregator: Option<String>,
    pub temperature: Option<f64>,

    /// Short description of the prompt
    pub prompt_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompt_messages: Vec<PromptMessage>,
    pub system_prompt: Option<String>,
    pub response_text: Option<String>,

    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub latency_ms: Option<f64>,

    pub routing_plan: Option<String>,
    pub routing_reasoning: Option<String>,

    /// Response id reported by the model API
    pub response_id: Option<String>,
    pub operation_id: Option<String>,
    /// Response id issued by the upstream provider (router/aggregator case)
    pub provider_response_id: Option<String>,

    /// Optimization iteration
    pub iteration: Option<u32>,
    /// Coarse phase tag (e.g. "student", "reflection")
    pub role: Option<String>,

    pub dataset_row_id: Option<String>,
    pub dataset_row_input: Option<String>,
    pub dataset_row_expected: Option<String>,
    pub dataset_row_label: Option<String>,
}

impl DerivedAttributes {
    /// First user-role message of the prompt
    pub fn first_user_message(&self) -> Option<&str> {
        self.prompt_messages
            .iter()
            .find(|m| m.role.eq_ignore_ascii_case("user"))
            .map(|m| m.content.as_str())
    }
}

/// Maps a raw attribute bag to [`DerivedAttributes`]
pub trait AttributeDeriver: Send + Sync {
    fn derive(&self, attributes: &Map<String, Value>) -> DerivedAttributes;
}

/// Default deriver driven by ordered probe lists
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeDeriver;

impl AttributeDeriver for ProbeDeriver {
    fn derive(&self, attrs: &Map<String, Value>) -> DerivedAttributes {
        let prompt_messages = first_match(attrs, PROMPT_MESSAGES).unwrap_or_default();
        let routing = first_match(attrs, ROUTING);

        let system_prompt = first_match(attrs, SYSTEM_PROMPT).or_else(|| {
            prompt_messages
                .iter()
                .find(|m| m.role.eq_ignore_ascii_case("system"))
                .and_then(|m| non_empty(&m.content))
        });

        let mut derived = DerivedAttributes {
            model_id: first_match(attrs, MODEL_ID),
            provider: first_match(attrs, PROVIDER),
            aggregator: first_match(attrs, AGGREGATOR),
            temperature: first_match(attrs, TEMPERATURE),
            prompt_summary: first_match(attrs, PROMPT_SUMMARY),
            prompt_messages,
            system_prompt,
            response_text: first_match(attrs, RESPONSE_TEXT),
            prompt_tokens: first_match(attrs, PROMPT_TOKENS),
            completion_tokens: first_match(attrs, COMPLETION_TOKENS),
            total_tokens: first_match(attrs, TOTAL_TOKENS),
            cost_usd: first_match(attrs, COST_USD),
            latency_ms: first_match(attrs, LATENCY_MS),
            routing_plan: routing.as_ref().and_then(|r| r.plan.clone()),
            routing_reasoning: routing.and_then(|r| r.reasoning),
            response_id: first_match(attrs, RESPONSE_ID),
            operation_id: first_match(attrs, OPERATION_ID),
            provider_response_id: first_match(attrs, PROVIDER_RESPONSE_ID),
            iteration: first_match(attrs, ITERATION),
            role: first_match(attrs, ROLE),
            dataset_row_id: first_match(attrs, ROW_ID),
            dataset_row_input: first_match(attrs, ROW_INPUT),
            dataset_row_expected: first_match(attrs, ROW_EXPECTED),
            dataset_row_label: first_match(attrs, ROW_LABEL),
        };

        if derived.prompt_summary.is_none() {
            derived.prompt_summary = derived.first_user_message().and_then(summarize);
        }

        derived
    }
}

// =============================================================================
// PROBES
// =============================================================================

/// A path into the attribute bag plus the parser for the value found there
struct Probe<T: 'static> {
    path: &'static str,
    parse: fn(&Value) -> Option<T>,
}

const fn probe<T>(path: &'static str, parse: fn(&Value) -> Option<T>) -> Probe<T> {
    Probe { path, parse }
}

static MODEL_ID: &[Probe<String>] = &[
    probe("gen_ai.response.model", text),
    probe("gen_ai.request.model", text),
    probe("llm.model_name", text),
    probe("ai.model.id", text),
    probe("ai.response.model", text),
    probe("model", text),
];

static PROVIDER: &[Probe<String>] = &[
    probe("gen_ai.provider.name", text),
    probe("gen_ai.system", text),
    probe("llm.provider", text),
    probe("ai.model.provider", text),
    probe("provider", text),
];

static AGGREGATOR: &[Probe<String>] = &[
    probe("gepa.aggregator", text),
    probe("llm.aggregator", text),
    probe("aggregator", text),
];

static TEMPERATURE: &[Probe<f64>] = &[
    probe("gen_ai.request.temperature", float),
    probe("llm.invocation_parameters.temperature", float),
    probe("ai.settings.temperature", float),
    probe("temperature", float),
];

static PROMPT_SUMMARY: &[Probe<String>] = &[
    probe("gepa.promptSummary", text),
    probe("ai.prompt.summary", text),
    probe("promptSummary", text),
    probe("prompt_summary", text),
];

static PROMPT_MESSAGES: &[Probe<Vec<PromptMessage>>] = &[
    probe("gen_ai.prompt", messages),
    probe("gen_ai.input.messages", messages),
    probe("ai.prompt.messages", messages),
    probe("llm.input_messages", messages),
    probe("messages", messages),
];

static SYSTEM_PROMPT: &[Probe<String>] = &[
    probe("gepa.systemPrompt", text),
    probe("gen_ai.system_instructions", text),
    probe("ai.prompt.system", text),
    probe("systemPrompt", text),
    probe("system_prompt", text),
];

static RESPONSE_TEXT: &[Probe<String>] = &[
    probe("gen_ai.completion", text),
    probe("ai.response.text", text),
    probe("llm.output_text", text),
    probe("output.value", text),
    probe("responseText", text),
    probe("response_text", text),
];

static PROMPT_TOKENS: &[Probe<u64>] = &[
    probe("gen_ai.usage.input_tokens", unsigned),
    probe("gen_ai.usage.prompt_tokens", unsigned),
    probe("llm.token_count.prompt", unsigned),
    probe("ai.usage.promptTokens", unsigned),
    probe("ai.usage.inputTokens", unsigned),
    probe("promptTokens", unsigned),
];

static COMPLETION_TOKENS: &[Probe<u64>] = &[
    probe("gen_ai.usage.output_tokens", unsigned),
    probe("gen_ai.usage.completion_tokens", unsigned),
    probe("llm.token_count.completion", unsigned),
    probe("ai.usage.completionTokens", unsigned),
    probe("ai.usage.outputTokens", unsigned),
    probe("completionTokens", unsigned),
];

static TOTAL_TOKENS: &[Probe<u64>] = &[
    probe("gen_ai.usage.total_tokens", unsigned),
    probe("llm.token_count.total", unsigned),
    probe("ai.usage.totalTokens", unsigned),
    probe("totalTokens", unsigned),
];

static COST_USD: &[Probe<f64>] = &[
    probe("gen_ai.usage.cost", float),
    probe("llm.cost.total", float),
    probe("ai.usage.cost", float),
    probe("gepa.costUsd", float),
    probe("costUsd", float),
    probe("cost", float),
];

static LATENCY_MS: &[Probe<f64>] = &[
    probe("gepa.latencyMs", float),
    probe("ai.response.msToFinish", float),
    probe("llm.latency_ms", float),
    probe("latencyMs", float),
];

static ROUTING: &[Probe<Routing>] = &[
    probe("gepa.routing", routing),
    probe("openrouter.routing", routing),
    probe("routing", routing),
];

static RESPONSE_ID: &[Probe<String>] = &[
    probe("gen_ai.response.id", text),
    probe("ai.response.id", text),
    probe("llm.response.id", text),
    probe("responseId", text),
];

static OPERATION_ID: &[Probe<String>] = &[
    probe("gepa.operationId", text),
    probe("ai.operationId", text),
    probe("operation.name", text),
    probe("operationId", text),
];

static PROVIDER_RESPONSE_ID: &[Probe<String>] = &[
    probe("gepa.providerResponseId", text),
    probe("ai.response.providerResponseId", text),
    probe("openrouter.response.id", text),
    probe("providerResponseId", text),
    probe("provider_response_id", text),
];

static ITERATION: &[Probe<u32>] = &[
    probe("gepa.iteration", small_unsigned),
    probe("iteration", small_unsigned),
];

static ROLE: &[Probe<String>] = &[probe("gepa.role", text), probe("role", text)];

static ROW_ID: &[Probe<String>] = &[
    probe("gepa.rowId", text),
    probe("gepa.row_id", text),
    probe("dataset.row_id", text),
    probe("rowId", text),
];

static ROW_INPUT: &[Probe<String>] = &[
    probe("gepa.rowInput", text),
    probe("dataset.input", text),
    probe("rowInput", text),
];

static ROW_EXPECTED: &[Probe<String>] = &[
    probe("gepa.rowExpected", text),
    probe("dataset.expected", text),
    probe("rowExpected", text),
];

static ROW_LABEL: &[Probe<String>] = &[
    probe("gepa.rowLabel", text),
    probe("dataset.label", text),
    probe("rowLabel", text),
];

fn first_match<T>(attrs: &Map<String, Value>, probes: &[Probe<T>]) -> Option<T> {
    probes
        .iter()
        .find_map(|p| lookup(attrs, p.path).and_then(p.parse))
}

/// Resolve a dotted path: flat key first, then nested objects.
fn lookup<'a>(attrs: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = attrs.get(path) {
        return Some(value);
    }
    let mut parts = path.split('.');
    let mut current = attrs.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

// =============================================================================
// PARSERS
// =============================================================================

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn float(value: &Value) -> Option<f64> {
    let f = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}

fn unsigned(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.round() as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn small_unsigned(value: &Value) -> Option<u32> {
    unsigned(value).and_then(|n| u32::try_from(n).ok())
}

/// Values sometimes arrive JSON-encoded inside a string attribute
fn decoded(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) => serde_json::from_str(s).ok(),
        other => Some(other.clone()),
    }
}

fn messages(value: &Value) -> Option<Vec<PromptMessage>> {
    let value = decoded(value)?;
    let parsed: Vec<PromptMessage> = value
        .as_array()?
        .iter()
        .filter_map(|m| {
            let role = m.get("role").and_then(Value::as_str)?.to_string();
            let content = message_content(m.get("content")?)?;
            Some(PromptMessage { role, content })
        })
        .collect();
    if parsed.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

/// Content is either a string or a list of parts carrying `text`
fn message_content(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let joined: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join("\n"))
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct Routing {
    plan: Option<String>,
    reasoning: Option<String>,
}

fn routing(value: &Value) -> Option<Routing> {
    let value = decoded(value)?;
    let obj = value.as_object()?;
    let plan = obj.get("plan").and_then(|p| match p {
        Value::String(s) => non_empty(s),
        Value::Null => None,
        other => Some(other.to_string()),
    });
    let reasoning = obj.get("reasoning").and_then(text);
    if plan.is_none() && reasoning.is_none() {
        None
    } else {
        Some(Routing { plan, reasoning })
    }
}

fn summarize(message: &str) -> Option<String> {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    if collapsed.chars().count() <= SUMMARY_MAX_CHARS {
        Some(collapsed)
    } else {
        let cut: String = collapsed.chars().take(SUMMARY_MAX_CHARS).collect();
        Some(format!("{}...", cut))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn derive(value: Value) -> DerivedAttributes {
        let attrs = value.as_object().cloned().unwrap_or_default();
        ProbeDeriver.derive(&attrs)
    }

    #[test]
    fn test_gepa_namespace() {
        let d = derive(json!({"gepa.rowId": "row-1", "gepa.iteration": 1, "gepa.role": "student"}));
        assert_eq!(d.dataset_row_id.as_deref(), Some("row-1"));
        assert_eq!(d.iteration, Some(1));
        assert_eq!(d.role.as_deref(), Some("student"));
    }

    #[test]
    fn test_probe_order_prefers_earlier_spelling() {
        let d = derive(json!({
            "llm.token_count.prompt": 7,
            "gen_ai.usage.input_tokens": 11
        }));
        assert_eq!(d.prompt_tokens, Some(11));
    }

    #[test]
    fn test_nested_paths_and_numeric_strings() {
        let d = derive(json!({
            "ai": {"usage": {"promptTokens": "12", "completionTokens": 3}},
            "gen_ai.request.temperature": "0.7"
        }));
        assert_eq!(d.prompt_tokens, Some(12));
        assert_eq!(d.completion_tokens, Some(3));
        assert_eq!(d.temperature, Some(0.7));
    }

    #[test]
    fn test_unparseable_values_degrade_to_none() {
        let d = derive(json!({
            "gen_ai.usage.input_tokens": "lots",
            "gen_ai.request.temperature": {"x": 1},
            "gepa.iteration": -4,
            "gepa.rowId": "   "
        }));
        assert_eq!(d.prompt_tokens, None);
        assert_eq!(d.temperature, None);
        assert_eq!(d.iteration, None);
        assert_eq!(d.dataset_row_id, None);
    }

    #[test]
    fn test_messages_from_encoded_string() {
        let encoded = json!([
            {"role": "system", "content": "You are terse."},
            {"role": "user", "content": [{"type": "text", "text": "What is   2+2?"}]}
        ])
        .to_string();
        let d = derive(json!({ "ai.prompt.messages": encoded }));
        assert_eq!(d.prompt_messages.len(), 2);
        assert_eq!(d.system_prompt.as_deref(), Some("You are terse."));
        assert_eq!(d.first_user_message(), Some("What is   2+2?"));
        assert_eq!(d.prompt_summary.as_deref(), Some("What is 2+2?"));
    }

    #[test]
    fn test_routing_metadata() {
        let d = derive(json!({
            "gepa.routing": "{\"plan\": [\"a\", \"b\"], \"reasoning\": \"cheapest first\"}"
        }));
        assert_eq!(d.routing_plan.as_deref(), Some("[\"a\",\"b\"]"));
        assert_eq!(d.routing_reasoning.as_deref(), Some("cheapest first"));

        let d = derive(json!({ "gepa.routing": "{not json" }));
        assert!(d.routing_plan.is_none());
        assert!(d.routing_reasoning.is_none());
    }

    #[test]
    fn test_provider_response_id_spellings() {
        let d = derive(json!({"providerResponseId": "prov-9", "ai.response.id": "resp-1"}));
        assert_eq!(d.provider_response_id.as_deref(), Some("prov-9"));
        assert_eq!(d.response_id.as_deref(), Some("resp-1"));
    }

    #[test]
    fn test_long_summary_is_truncated() {
        let long = "word ".repeat(100);
        let d = derive(json!({ "messages": [{"role": "user", "content": long}] }));
        let summary = d.prompt_summary.unwrap();
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS + 3);
    }
}
