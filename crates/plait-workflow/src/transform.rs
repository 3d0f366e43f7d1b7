use plait_core::error::Result;
use plait_core::types::ChatCompletionMessage;
use plait_core::workflow::{TransformOp, TransformSpec, TrimMode};

pub fn trim(text: &str, mode: TrimMode) -> &str {
    match mode {
        TrimMode::Start => text.trim_start(),
        TrimMode::End => text.trim_end(),
        TrimMode::Both => text.trim(),
    }
}

/// Apply one transform to a piece of text.
pub fn apply(text: &str, spec: &TransformSpec) -> Result<String> {
    match &spec.op {
        TransformOp::Trim(mode) => Ok(trim(text, *mode).to_string()),
        TransformOp::Regex(rx) => {
            let re = rx.build()?;
            let replacement = rx.replacement(&re);
            let replaced = if rx.replace_all() {
                re.replace_all(text, replacement.as_str())
            } else {
                re.replacen(text, 1, replacement.as_str())
            };
            Ok(replaced.into_owned())
        }
    }
}

/// Apply transforms in order to a text.
pub fn transform_text<'a>(
    text: String,
    specs: impl IntoIterator<Item = &'a TransformSpec>,
) -> Result<String> {
    specs.into_iter().try_fold(text, |acc, spec| apply(&acc, spec))
}

/// Apply transforms to each message's content.
///
/// Returns the new list and whether any content actually changed.
pub fn transform_messages<'a>(
    messages: Vec<ChatCompletionMessage>,
    specs: impl IntoIterator<Item = &'a TransformSpec> + Clone,
) -> Result<(Vec<ChatCompletionMessage>, bool)> {
    let mut changed = false;
    let mut out = Vec::with_capacity(messages.len());
    for mut message in messages {
        let content = transform_text(message.content.clone(), specs.clone())?;
        if content != message.content {
            changed = true;
            message.content = content;
        }
        out.push(message);
    }
    Ok((out, changed))
}
