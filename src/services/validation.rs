use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

use crate::config::Limits;
use crate::models::Role;
use crate::providers::registry::Capability;
use crate::providers::{ChatMessage, ImageAttachment, ModelConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid request: messages array required")]
    MissingMessages,

    #[error("Invalid request: unknown role '{0}'")]
    UnknownRole(String),

    #[error("Message must have either text or an image.")]
    EmptyMessage,

    #[error("Too many images: {count} attached, at most {max} allowed per message")]
    TooManyImages { count: usize, max: usize },

    #[error("Message too long: {chars} characters, at most {max} allowed")]
    TextTooLong { chars: usize, max: usize },

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Image too large: {size} bytes, at most {max} allowed")]
    ImageTooLarge { size: usize, max: usize },

    #[error("{0} does not accept images")]
    ImagesNotSupported(String),

    #[error("Request body too large: at most {max} bytes allowed")]
    BodyTooLarge { max: usize },
}

/// A chat message as clients send it: either `parts`, or `content` as a
/// string or a part list.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub parts: Option<Vec<InboundPart>>,
    #[serde(default)]
    pub content: Option<InboundContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundContent {
    Text(String),
    Parts(Vec<InboundPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundPart {
    Text { text: String },
    Image { image: String },
    #[serde(other)]
    Other,
}

/// The one internal view of a message body, whatever shape it arrived in.
/// Images are still undecoded data URIs.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub role: Role,
    pub text_parts: Vec<String>,
    pub images: Vec<String>,
}

impl NormalizedMessage {
    pub fn text(&self) -> String {
        self.text_parts.join("\n")
    }

    pub fn text_chars(&self) -> usize {
        self.text_parts.iter().map(|t| t.chars().count()).sum()
    }

    pub fn has_body(&self) -> bool {
        self.text_parts.iter().any(|t| !t.trim().is_empty()) || !self.images.is_empty()
    }
}

impl InboundMessage {
    pub fn normalize(&self) -> Result<NormalizedMessage, ValidationError> {
        let role = Role::from_str(&self.role)
            .ok_or_else(|| ValidationError::UnknownRole(self.role.clone()))?;

        let parts: Vec<InboundPart> = match (&self.parts, &self.content) {
            (Some(parts), _) => parts.clone(),
            (None, Some(InboundContent::Parts(parts))) => parts.clone(),
            (None, Some(InboundContent::Text(text))) => vec![InboundPart::Text { text: text.clone() }],
            (None, None) => Vec::new(),
        };

        let mut normalized = NormalizedMessage {
            role,
            text_parts: Vec::new(),
            images: Vec::new(),
        };
        for part in parts {
            match part {
                InboundPart::Text { text } => normalized.text_parts.push(text),
                InboundPart::Image { image } => normalized.images.push(image),
                InboundPart::Other => {}
            }
        }
        Ok(normalized)
    }
}

/// Normalize every message and check the newest one against the limits.
/// Runs before any storage or provider work.
pub fn validate_messages(
    messages: &[InboundMessage],
    limits: &Limits,
) -> Result<Vec<NormalizedMessage>, ValidationError> {
    if messages.is_empty() {
        return Err(ValidationError::MissingMessages);
    }

    let normalized = messages
        .iter()
        .map(InboundMessage::normalize)
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(last) = normalized.last() {
        check_limits(last, limits)?;
    }
    Ok(normalized)
}

pub fn check_limits(message: &NormalizedMessage, limits: &Limits) -> Result<(), ValidationError> {
    if message.images.len() > limits.max_images_per_message {
        return Err(ValidationError::TooManyImages {
            count: message.images.len(),
            max: limits.max_images_per_message,
        });
    }

    let chars = message.text_chars();
    if chars > limits.max_input_chars() {
        return Err(ValidationError::TextTooLong {
            chars,
            max: limits.max_input_chars(),
        });
    }

    if !message.has_body() {
        return Err(ValidationError::EmptyMessage);
    }
    Ok(())
}

/// Images only go to models that can see them.
pub fn check_model_support(model: &ModelConfig, message: &NormalizedMessage) -> Result<(), ValidationError> {
    if !message.images.is_empty() && !model.supports(Capability::Vision) {
        return Err(ValidationError::ImagesNotSupported(model.name.to_string()));
    }
    Ok(())
}

/// Decode a `data:image/...;base64,...` URI.
pub fn decode_data_uri(uri: &str, max_size: usize) -> Result<ImageAttachment, ValidationError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| ValidationError::InvalidImage("expected a base64 data URI".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| ValidationError::InvalidImage("malformed data URI".to_string()))?;
    let mime_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| ValidationError::InvalidImage("data URI is not base64".to_string()))?;
    if !mime_type.starts_with("image/") {
        return Err(ValidationError::InvalidImage(format!(
            "unsupported media type {}",
            mime_type
        )));
    }

    // Reject before decoding: base64 is 4 chars per 3 bytes.
    let estimated = payload.len() / 4 * 3;
    if estimated > max_size + 3 {
        return Err(ValidationError::ImageTooLarge {
            size: estimated,
            max: max_size,
        });
    }

    let data = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ValidationError::InvalidImage(e.to_string()))?;
    if data.len() > max_size {
        return Err(ValidationError::ImageTooLarge {
            size: data.len(),
            max: max_size,
        });
    }

    Ok(ImageAttachment {
        mime_type: mime_type.to_string(),
        data,
    })
}

/// Provider-ready messages with decoded images.
pub fn to_chat_messages(
    messages: &[NormalizedMessage],
    max_image_size: usize,
) -> Result<Vec<ChatMessage>, ValidationError> {
    messages
        .iter()
        .map(|m| {
            let images = m
                .images
                .iter()
                .map(|uri| decode_data_uri(uri, max_image_size))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ChatMessage {
                role: m.role,
                content: m.text(),
                images,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Vec<InboundMessage> {
        serde_json::from_value(value).unwrap()
    }

    const PNG_URI: &str = "data:image/png;base64,iVBORw==";

    #[test]
    fn test_all_shapes_normalize_alike() {
        let shapes = parse(json!([
            {"role": "user", "parts": [{"type": "text", "text": "hi"}, {"type": "image", "image": PNG_URI}]},
            {"role": "user", "content": [{"type": "text", "text": "hi"}, {"type": "image", "image": PNG_URI}]},
        ]));
        let a = shapes[0].normalize().unwrap();
        let b = shapes[1].normalize().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.images.len(), 1);

        let plain = parse(json!([{"role": "user", "content": "hi"}]));
        let c = plain[0].normalize().unwrap();
        assert_eq!(c.text(), "hi");
        assert!(c.images.is_empty());
    }

    #[test]
    fn test_unknown_parts_are_ignored() {
        let msgs = parse(json!([
            {"role": "assistant", "parts": [{"type": "step-start"}, {"type": "text", "text": "ok"}]}
        ]));
        assert_eq!(msgs[0].normalize().unwrap().text_parts, vec!["ok".to_string()]);
    }

    #[test]
    fn test_too_many_images() {
        let limits = Limits::default();
        let msgs = parse(json!([
            {"role": "user", "content": [
                {"type": "image", "image": PNG_URI},
                {"type": "image", "image": PNG_URI}
            ]}
        ]));
        let err = validate_messages(&msgs, &limits).unwrap_err();
        assert_eq!(err, ValidationError::TooManyImages { count: 2, max: 1 });
    }

    #[test]
    fn test_text_limit_counts_all_parts() {
        let limits = Limits {
            max_input_tokens: 2,
            ..Limits::default()
        };
        let msgs = parse(json!([
            {"role": "user", "parts": [{"type": "text", "text": "abcde"}, {"type": "text", "text": "fghi"}]}
        ]));
        let err = validate_messages(&msgs, &limits).unwrap_err();
        assert_eq!(err, ValidationError::TextTooLong { chars: 9, max: 8 });
    }

    #[test]
    fn test_only_last_message_is_limited() {
        let limits = Limits {
            max_input_tokens: 1,
            ..Limits::default()
        };
        let msgs = parse(json!([
            {"role": "user", "content": "a long earlier message"},
            {"role": "user", "content": "ok"}
        ]));
        assert_eq!(validate_messages(&msgs, &limits).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_and_bad_role() {
        let limits = Limits::default();
        assert_eq!(
            validate_messages(&[], &limits).unwrap_err(),
            ValidationError::MissingMessages
        );
        let msgs = parse(json!([{"role": "robot", "content": "x"}]));
        assert_eq!(
            validate_messages(&msgs, &limits).unwrap_err(),
            ValidationError::UnknownRole("robot".into())
        );
        let msgs = parse(json!([{"role": "user", "content": "  "}]));
        assert_eq!(
            validate_messages(&msgs, &limits).unwrap_err(),
            ValidationError::EmptyMessage
        );
    }

    #[test]
    fn test_decode_data_uri() {
        let image = decode_data_uri(PNG_URI, 1024).unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.data, vec![0x89, b'P', b'N', b'G']);

        assert!(matches!(
            decode_data_uri("https://example.com/cat.png", 1024),
            Err(ValidationError::InvalidImage(_))
        ));
        assert!(matches!(
            decode_data_uri("data:text/plain;base64,aGk=", 1024),
            Err(ValidationError::InvalidImage(_))
        ));
        assert!(matches!(
            decode_data_uri(PNG_URI, 3),
            Err(ValidationError::ImageTooLarge { size: 4, max: 3 })
        ));
    }

    #[test]
    fn test_images_need_a_vision_model() {
        use crate::models::ProviderId;
        use crate::providers::registry::Tier;

        let text_only = ModelConfig {
            id: "text-only",
            name: "Text Only",
            provider: ProviderId::OpenAi,
            api_identifier: "text-only",
            tier: Tier::Free,
            capabilities: &[],
        };
        let msgs = parse(json!([{"role": "user", "content": [
            {"type": "text", "text": "what is this?"},
            {"type": "image", "image": PNG_URI},
        ]}]));
        let with_image = msgs[0].normalize().unwrap();
        assert_eq!(
            check_model_support(&text_only, &with_image).unwrap_err(),
            ValidationError::ImagesNotSupported("Text Only".into())
        );

        let plain = parse(json!([{"role": "user", "content": "hi"}]));
        assert!(check_model_support(&text_only, &plain[0].normalize().unwrap()).is_ok());

        let vision = crate::providers::find_model("gpt-4o-mini").unwrap();
        assert!(check_model_support(vision, &with_image).is_ok());
    }
}
