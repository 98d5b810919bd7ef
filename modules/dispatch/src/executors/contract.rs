//! Response contracts for decision bindings
//!
//! Provider output is free text. A contract turns it into exactly one
//! outbound payload, or explains why it could not.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContract {
    /// One of a fixed set of answers, matched case-insensitively.
    /// Emits `{ field: options[answer] }`.
    Choice {
        field: String,
        options: BTreeMap<String, Value>,
    },
    /// A JSON object carrying at least the `required` keys
    Json {
        #[serde(default)]
        required: Vec<String>,
    },
    /// Any non-empty text. Emits `{ field: text }`.
    Text { field: String },
}

impl ResponseContract {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ResponseContract::Choice { field, options } => {
                if field.trim().is_empty() {
                    return Err("choice contract needs a field name".to_string());
                }
                if options.is_empty() {
                    return Err("choice contract needs at least one option".to_string());
                }
                let mut seen = std::collections::HashSet::new();
                for key in options.keys() {
                    let normalized = key.trim().to_lowercase();
                    if normalized.is_empty() {
                        return Err("choice options must not be blank".to_string());
                    }
                    if !seen.insert(normalized) {
                        return Err(format!("choice option '{key}' differs only by case"));
                    }
                }
                Ok(())
            }
            ResponseContract::Json { required } => {
                if required.iter().any(|key| key.trim().is_empty()) {
                    return Err("json contract has a blank required key".to_string());
                }
                Ok(())
            }
            ResponseContract::Text { field } => {
                if field.trim().is_empty() {
                    return Err("text contract needs a field name".to_string());
                }
                Ok(())
            }
        }
    }

    /// Parse raw provider text into the outbound payload
    pub fn parse(&self, raw: &str) -> Result<Value, String> {
        match self {
            ResponseContract::Choice { field, options } => {
                let answer = normalize_answer(raw);
                options
                    .iter()
                    .find(|(key, _)| key.trim().to_lowercase() == answer)
                    .map(|(_, value)| single_field(field, value.clone()))
                    .ok_or_else(|| {
                        format!(
                            "answer '{}' is not one of: {}",
                            raw.trim(),
                            option_list(options)
                        )
                    })
            }
            ResponseContract::Json { required } => {
                let body = strip_code_blocks(raw);
                let value: Value = serde_json::from_str(body)
                    .map_err(|e| format!("response is not valid JSON: {e}"))?;
                let object = value
                    .as_object()
                    .ok_or_else(|| "response is not a JSON object".to_string())?;
                let missing: Vec<&str> = required
                    .iter()
                    .filter(|key| object.get(key.as_str()).map_or(true, Value::is_null))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    return Err(format!("response is missing: {}", missing.join(", ")));
                }
                Ok(value)
            }
            ResponseContract::Text { field } => {
                let text = raw.trim();
                if text.is_empty() {
                    return Err("response is empty".to_string());
                }
                Ok(single_field(field, Value::String(text.to_string())))
            }
        }
    }

    /// Instruction appended to the prompt when asking again after a parse failure
    pub fn reprompt(&self) -> String {
        match self {
            ResponseContract::Choice { options, .. } => format!(
                "Answer with exactly one of: {}. Reply with the answer only.",
                option_list(options)
            ),
            ResponseContract::Json { required } if required.is_empty() => {
                "Reply with a single JSON object and nothing else.".to_string()
            }
            ResponseContract::Json { required } => format!(
                "Reply with a single JSON object containing the keys {} and nothing else.",
                required.join(", ")
            ),
            ResponseContract::Text { .. } => "Reply with a non-empty answer.".to_string(),
        }
    }
}

fn single_field(field: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(field.to_string(), value);
    Value::Object(map)
}

fn option_list(options: &BTreeMap<String, Value>) -> String {
    options.keys().cloned().collect::<Vec<_>>().join(", ")
}

fn normalize_answer(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(['.', '!', '?', ',', ';', ':'])
        .trim_matches(['"', '\'', '`', '*'])
        .trim()
        .to_lowercase()
}

/// Strip markdown code fences from a model response
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn yes_no() -> ResponseContract {
        ResponseContract::Choice {
            field: "qualified".to_string(),
            options: BTreeMap::from([
                ("YES".to_string(), json!(true)),
                ("NO".to_string(), json!(false)),
            ]),
        }
    }

    #[test]
    fn choice_matches_case_insensitively() {
        let contract = yes_no();
        assert_eq!(contract.parse("YES"), Ok(json!({"qualified": true})));
        assert_eq!(contract.parse("  yes.\n"), Ok(json!({"qualified": true})));
        assert_eq!(contract.parse("\"No\""), Ok(json!({"qualified": false})));
        assert_eq!(contract.parse("**NO**"), Ok(json!({"qualified": false})));
    }

    #[test]
    fn choice_rejects_other_answers() {
        let err = yes_no().parse("maybe").unwrap_err();
        assert!(err.contains("maybe"));
        assert!(err.contains("NO, YES"));
        assert!(yes_no().parse("yes, definitely").is_err());
    }

    #[test]
    fn json_contract_checks_required_keys() {
        let contract = ResponseContract::Json {
            required: vec!["score".to_string(), "reason".to_string()],
        };
        assert_eq!(
            contract.parse("```json\n{\"score\": 7, \"reason\": \"fit\"}\n```"),
            Ok(json!({"score": 7, "reason": "fit"}))
        );
        assert!(contract.parse("{\"score\": 7}").unwrap_err().contains("reason"));
        assert!(contract.parse("[1, 2]").is_err());
        assert!(contract.parse("score: 7").is_err());
    }

    #[test]
    fn text_contract_wraps_non_empty_text() {
        let contract = ResponseContract::Text {
            field: "summary".to_string(),
        };
        assert_eq!(
            contract.parse("  Warm lead, follow up.  "),
            Ok(json!({"summary": "Warm lead, follow up."}))
        );
        assert!(contract.parse("   ").is_err());
    }

    #[test]
    fn validates_contract_shape() {
        assert!(yes_no().validate().is_ok());
        let empty = ResponseContract::Choice {
            field: "x".to_string(),
            options: BTreeMap::new(),
        };
        assert!(empty.validate().is_err());
        let clash = ResponseContract::Choice {
            field: "x".to_string(),
            options: BTreeMap::from([
                ("Yes".to_string(), json!(1)),
                ("YES".to_string(), json!(2)),
            ]),
        };
        assert!(clash.validate().is_err());
        assert!(ResponseContract::Text { field: " ".into() }.validate().is_err());
    }

    #[test]
    fn deserializes_tagged_config() {
        let contract: ResponseContract = serde_json::from_value(json!({
            "type": "choice",
            "field": "qualified",
            "options": {"YES": true, "NO": false}
        }))
        .unwrap();
        assert_eq!(contract, yes_no());
    }
}
