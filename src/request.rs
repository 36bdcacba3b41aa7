//! Normalization of the two wire encodings into one [`ChatRequest`].
//!
//! The structured body is checked against a small field table before it is
//! deserialized, so every shape problem is reported at once. The query
//! encoding only recognizes the literal string `"true"` as a true flag.

use crate::protocol::{ChatRequestBody, ValidationIssue};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Canonical generation request, whichever encoding produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatRequest {
    pub prompt: String,
    pub sandbox: bool,
    pub yolo: bool,
    pub model: Option<String>,
    pub working_directory: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Validation error")]
    Invalid(Vec<ValidationIssue>),
    #[error("Prompt parameter is required")]
    MissingPrompt,
}

#[derive(Debug, Clone, Copy)]
enum Shape {
    Flag,
    Text,
}

const OPTIONAL_FIELDS: &[(&str, Shape)] = &[
    ("sandbox", Shape::Flag),
    ("yolo", Shape::Flag),
    ("model", Shape::Text),
    ("workingDirectory", Shape::Text),
    ("apiKey", Shape::Text),
];

/// Normalizes a structured JSON submission.
pub fn from_body(value: Value) -> Result<ChatRequest, RequestError> {
    let Value::Object(mut fields) = value else {
        return Err(RequestError::Invalid(vec![ValidationIssue::new(
            "",
            "Expected object",
        )]));
    };

    // Explicit nulls mean "not supplied".
    fields.retain(|_, value| !value.is_null());

    let issues = validate_fields(&fields);
    if !issues.is_empty() {
        return Err(RequestError::Invalid(issues));
    }

    let body: ChatRequestBody = serde_json::from_value(Value::Object(fields))
        .map_err(|err| RequestError::Invalid(vec![ValidationIssue::new("", err.to_string())]))?;

    Ok(body.into())
}

/// Normalizes a flat query-parameter submission.
pub fn from_query(params: &HashMap<String, String>) -> Result<ChatRequest, RequestError> {
    let prompt = params
        .get("prompt")
        .filter(|prompt| !prompt.trim().is_empty())
        .ok_or(RequestError::MissingPrompt)?;

    Ok(ChatRequest {
        prompt: prompt.clone(),
        sandbox: query_flag(params, "sandbox"),
        yolo: query_flag(params, "yolo"),
        model: params.get("model").cloned(),
        working_directory: params.get("workingDirectory").cloned(),
        api_key: params.get("apiKey").cloned(),
    })
}

fn query_flag(params: &HashMap<String, String>, key: &str) -> bool {
    params.get(key).is_some_and(|value| value == "true")
}

fn validate_fields(fields: &Map<String, Value>) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    match fields.get("prompt") {
        None => issues.push(ValidationIssue::new("prompt", "Required")),
        Some(Value::String(prompt)) if prompt.trim().is_empty() => {
            issues.push(ValidationIssue::new("prompt", "Prompt must not be empty"))
        }
        Some(Value::String(_)) => {}
        Some(_) => issues.push(ValidationIssue::new("prompt", "Expected string")),
    }

    for (name, shape) in OPTIONAL_FIELDS {
        let Some(value) = fields.get(*name) else {
            continue;
        };
        match (shape, value) {
            (Shape::Flag, Value::Bool(_)) | (Shape::Text, Value::String(_)) => {}
            (Shape::Flag, _) => issues.push(ValidationIssue::new(*name, "Expected boolean")),
            (Shape::Text, _) => issues.push(ValidationIssue::new(*name, "Expected string")),
        }
    }

    issues
}

impl From<ChatRequestBody> for ChatRequest {
    fn from(body: ChatRequestBody) -> Self {
        Self {
            prompt: body.prompt,
            sandbox: body.sandbox,
            yolo: body.yolo,
            model: body.model,
            working_directory: body.working_directory,
            api_key: body.api_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn issues(result: Result<ChatRequest, RequestError>) -> Vec<ValidationIssue> {
        match result {
            Err(RequestError::Invalid(issues)) => issues,
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn body_with_only_prompt_uses_defaults() {
        let request = from_body(json!({"prompt": "list files"})).unwrap();
        assert_eq!(
            request,
            ChatRequest {
                prompt: "list files".into(),
                ..ChatRequest::default()
            }
        );
    }

    #[test]
    fn empty_body_reports_prompt() {
        let issues = issues(from_body(json!({})));
        assert_eq!(issues, vec![ValidationIssue::new("prompt", "Required")]);
    }

    #[test]
    fn whitespace_prompt_is_rejected_in_both_encodings() {
        let issues = issues(from_body(json!({"prompt": "   "})));
        assert_eq!(issues[0].path, "prompt");

        let result = from_query(&query(&[("prompt", " \t")]));
        assert!(matches!(result, Err(RequestError::MissingPrompt)));
    }

    #[test]
    fn body_collects_every_shape_issue() {
        let issues = issues(from_body(json!({
            "prompt": 7,
            "sandbox": "true",
            "model": false
        })));

        let paths: Vec<&str> = issues.iter().map(|issue| issue.path.as_str()).collect();
        assert_eq!(paths, vec!["prompt", "sandbox", "model"]);
    }

    #[test]
    fn non_object_body_is_invalid() {
        let issues = issues(from_body(json!(["prompt"])));
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn null_optional_fields_count_as_absent() {
        let request = from_body(json!({"prompt": "hi", "yolo": null, "model": null})).unwrap();
        assert!(!request.yolo);
        assert_eq!(request.model, None);
    }

    #[test]
    fn missing_query_prompt_is_reported() {
        let result = from_query(&query(&[("yolo", "true")]));
        assert!(matches!(result, Err(RequestError::MissingPrompt)));
        assert_eq!(
            RequestError::MissingPrompt.to_string(),
            "Prompt parameter is required"
        );
    }

    #[test]
    fn query_flags_accept_only_literal_true() {
        for (raw, expected) in [
            (Some("true"), true),
            (Some("1"), false),
            (Some("True"), false),
            (Some("yes"), false),
            (Some(""), false),
            (None, false),
        ] {
            let mut params = query(&[("prompt", "hi")]);
            if let Some(raw) = raw {
                params.insert("yolo".into(), raw.into());
            }
            let request = from_query(&params).unwrap();
            assert_eq!(request.yolo, expected, "yolo={raw:?}");
        }
    }

    #[test]
    fn equivalent_encodings_normalize_identically() {
        let from_json = from_body(json!({
            "prompt": "refactor main.rs",
            "sandbox": true,
            "yolo": false,
            "model": "gemini-2.5-pro",
            "workingDirectory": "/srv/app",
            "apiKey": "secret"
        }))
        .unwrap();

        let from_params = from_query(&query(&[
            ("prompt", "refactor main.rs"),
            ("sandbox", "true"),
            ("yolo", "false"),
            ("model", "gemini-2.5-pro"),
            ("workingDirectory", "/srv/app"),
            ("apiKey", "secret"),
        ]))
        .unwrap();

        assert_eq!(from_json, from_params);
    }
}
