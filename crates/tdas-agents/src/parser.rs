use rust_decimal::Decimal;
use tdas_models::opinion::RawOpinion;

use crate::error::AgentError;

/// Extract the first JSON object from a string that may contain surrounding text.
///
/// Handles common scoring-program output:
/// - Clean JSON: `{"key": "value"}`
/// - Markdown-wrapped: ```json\n{"key": "value"}\n```
/// - Log lines before the object: `scoring AAPL...\n{"key": "value"}`
pub fn extract_json(text: &str) -> Result<String, AgentError> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Ok(trimmed.to_string());
    }

    if let Some(json_str) = extract_from_markdown_block(trimmed) {
        if serde_json::from_str::<serde_json::Value>(&json_str).is_ok() {
            return Ok(json_str);
        }
    }

    if let Some(json_str) = extract_first_object(trimmed) {
        if serde_json::from_str::<serde_json::Value>(&json_str).is_ok() {
            return Ok(json_str);
        }
    }

    Err(AgentError::Parse(format!(
        "No valid JSON object found in output (length={})",
        text.len()
    )))
}

/// Extract JSON from a markdown code block (```json ... ``` or ``` ... ```)
fn extract_from_markdown_block(text: &str) -> Option<String> {
    let start_markers = ["```json\n", "```json\r\n", "```\n", "```\r\n"];

    for marker in &start_markers {
        if let Some(start) = text.find(marker) {
            let json_start = start + marker.len();
            if let Some(end) = text[json_start..].find("```") {
                let extracted = text[json_start..json_start + end].trim();
                return Some(extracted.to_string());
            }
        }
    }

    None
}

/// Find the first balanced { ... } in the text.
fn extract_first_object(text: &str) -> Option<String> {
    let mut depth = 0;
    let mut start = None;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if !in_string && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        return Some(text[s..=i].to_string());
                    }
                }
            }
            _ => {}
        }
    }

    None
}

/// Reject raw opinions whose fractional fields fall outside [0, 1].
pub fn validate_raw_opinion(raw: &RawOpinion) -> Result<(), AgentError> {
    if raw.confidence < Decimal::ZERO || raw.confidence > Decimal::ONE {
        return Err(AgentError::InvalidOpinion(format!(
            "confidence {} outside [0, 1]",
            raw.confidence
        )));
    }
    if let Some(score) = raw.score {
        if score < Decimal::ZERO || score > Decimal::ONE {
            return Err(AgentError::InvalidOpinion(format!(
                "score {score} outside [0, 1]"
            )));
        }
    }
    Ok(())
}

/// Parse and validate a raw opinion from scoring-program output.
pub fn parse_raw_opinion(raw: &str) -> Result<RawOpinion, AgentError> {
    let json_str = extract_json(raw)?;
    let opinion: RawOpinion = serde_json::from_str(&json_str).map_err(|e| {
        AgentError::Parse(format!("Failed to parse opinion: {e}\nJSON: {json_str}"))
    })?;
    validate_raw_opinion(&opinion)?;
    Ok(opinion)
}
