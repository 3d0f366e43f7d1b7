use serde_json::{Map, Value};
use tracing::{debug, warn};

use plait_core::workflow::{CaptureKind, OutputCapture};
use plait_prompt::value::{lookup, parse_path};

/// Unwrap a fenced code block if the text contains one.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip an optional language tag on the fence line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }

    trimmed
}

/// Capture every declared output from `text`.
///
/// A JSON capture whose text does not parse, or whose path does not exist,
/// leaves its key out of the result.
pub fn capture_outputs(text: &str, outputs: &[OutputCapture]) -> Map<String, Value> {
    let mut captured = Map::new();
    let mut parsed: Option<Option<Value>> = None;

    for output in outputs {
        match &output.capture {
            CaptureKind::AssistantText => {
                captured.insert(output.key.clone(), Value::String(text.to_string()));
            }
            CaptureKind::JsonParsed { json_path } => {
                let document = parsed.get_or_insert_with(|| {
                    match serde_json::from_str::<Value>(strip_code_fences(text)) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(key = %output.key, error = %e, "Response is not valid JSON, skipping capture");
                            None
                        }
                    }
                });
                let Some(document) = document else {
                    continue;
                };
                let value = match json_path.as_deref() {
                    Some(path) => lookup(document, &parse_path(path)),
                    None => Some(&*document),
                };
                match value {
                    Some(value) => {
                        captured.insert(output.key.clone(), value.clone());
                    }
                    None => {
                        debug!(key = %output.key, path = ?json_path, "JSON path not present, skipping capture");
                    }
                }
            }
        }
    }

    captured
}
