//! Content extraction from raw protocol messages.

use crate::transport::{MediaPart, RawMessage};

#[derive(Debug, Clone, Default)]
pub struct ExtractedContent {
    pub text: String,
    /// Type tag: `image`, `audio`, `video`, `document`, `sticker`, or
    /// empty when the message carries no media.
    pub media_type: String,
    pub media: Option<MediaPart>,
    pub ephemeral_expiration: Option<i64>,
}

impl ExtractedContent {
    /// An event with neither text nor media is skipped, not stored.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.media.is_none()
    }
}

/// Unwrap nested wrappers and pull out text, media, and the type tag.
///
/// Text priority: conversation > extended text > media caption.
pub fn extract(raw: &RawMessage) -> ExtractedContent {
    let mut inner = raw;
    // The real content may sit behind device_sent/ephemeral/view_once
    // wrappers, possibly stacked.
    loop {
        inner = match (&inner.device_sent, &inner.ephemeral, &inner.view_once) {
            (Some(wrapped), _, _) | (_, Some(wrapped), _) | (_, _, Some(wrapped)) => &**wrapped,
            _ => break,
        };
    }

    let ephemeral_expiration = raw.ephemeral_expiration.or(inner.ephemeral_expiration);

    let (media_type, media) = if let Some(part) = &inner.image {
        ("image", Some(part.clone()))
    } else if let Some(part) = &inner.audio {
        ("audio", Some(part.clone()))
    } else if let Some(part) = &inner.video {
        ("video", Some(part.clone()))
    } else if let Some(part) = &inner.document {
        ("document", Some(part.clone()))
    } else if let Some(part) = &inner.sticker {
        ("sticker", Some(part.clone()))
    } else {
        ("", None)
    };

    let text = inner
        .conversation
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| inner.extended_text.clone().filter(|t| !t.is_empty()))
        .or_else(|| media.as_ref().and_then(|m| m.caption.clone()))
        .unwrap_or_default();

    ExtractedContent {
        text,
        media_type: media_type.to_string(),
        media,
        ephemeral_expiration,
    }
}
