//! Tool definitions, tool calls and `tool_choice`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A tool definition (request side) or a tool call (response side).
///
/// In streamed deltas `index` names the concurrent call a fragment belongs to;
/// whole responses leave it unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default = "default_tool_type", skip_serializing_if = "String::is_empty")]
    pub tool_type: String,
    #[serde(default)]
    pub function: Function,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

fn default_tool_type() -> String {
    "function".to_string()
}

impl Tool {
    pub fn call(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            tool_type: default_tool_type(),
            function: Function {
                name: name.into(),
                arguments: Some(arguments.into()),
                ..Default::default()
            },
            index: None,
        }
    }

    /// Arguments string, empty when absent.
    pub fn arguments(&self) -> &str {
        self.function.arguments.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Function {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_arguments"
    )]
    pub arguments: Option<String>,
}

// Some backends send `arguments` as an object instead of a JSON string.
fn deserialize_arguments<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// `tool_choice`: a mode string (`auto`, `none`, `required`) or a named function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Named(NamedToolChoice),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedToolChoice {
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
    pub function: NamedFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedFunction {
    pub name: String,
}

impl ToolChoice {
    pub fn named(name: impl Into<String>) -> Self {
        ToolChoice::Named(NamedToolChoice {
            tool_type: default_tool_type(),
            function: NamedFunction { name: name.into() },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_arguments_become_string() {
        let t: Tool = serde_json::from_str(
            r#"{"id":"c1","type":"function","function":{"name":"w","arguments":{"loc":"SF"}}}"#,
        )
        .unwrap();
        assert_eq!(t.arguments(), r#"{"loc":"SF"}"#);
    }

    #[test]
    fn test_tool_choice_shapes() {
        let a: ToolChoice = serde_json::from_str(r#""auto""#).unwrap();
        assert_eq!(a, ToolChoice::Mode("auto".into()));
        let b: ToolChoice =
            serde_json::from_str(r#"{"type":"function","function":{"name":"w"}}"#).unwrap();
        assert_eq!(b, ToolChoice::named("w"));
    }

    #[test]
    fn test_stream_delta_without_name() {
        let t: Tool =
            serde_json::from_str(r#"{"index":0,"function":{"arguments":"{\"a\""}}"#).unwrap();
        assert_eq!(t.index, Some(0));
        assert!(t.function.name.is_empty());
        assert!(t.id.is_none());
    }
}
