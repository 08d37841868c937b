//! Image-to-text backends.
//!
//! The batch runner only knows about the [`Captioner`] trait; each hosted
//! or local model lives behind its own implementation.

pub mod gemini;
pub mod ollama;

pub use gemini::{GeminiCaptioner, GeminiConfig};
pub use ollama::{GenerateOptions, OllamaCaptioner, OllamaConfig};

use std::future::Future;
use std::path::Path;

use crate::error::CaptionError;
use crate::types::ImagePayload;

/// Instruction sent with every image unless overridden.
pub const DEFAULT_REVERSE_PROMPT: &str = "Create a 30–60 word reverse prompt that describes only what is visible. \
Order exactly: Subject; Setting; Style; Composition; Palette; Lighting; Mood; \
Details (2–3 nouns); Camera; Post; Avoid. \
No lore, brands, or software/model names.";

/// A backend that turns one image into one caption.
///
/// Implementations must report failures through [`CaptionError`] so the
/// runner can tell transient errors (retry) from permanent ones (record
/// and move on).
///
/// # Example
///
/// ```ignore
/// struct Fixed;
///
/// impl Captioner for Fixed {
///     async fn caption(&self, _image: &ImagePayload) -> Result<String, CaptionError> {
///         Ok("A quiet harbor at dawn.".to_string())
///     }
///
///     fn model(&self) -> &str {
///         "fixed"
///     }
/// }
/// ```
pub trait Captioner: Send + Sync {
    /// Generate a caption for one image. Called once per attempt.
    fn caption(
        &self,
        image: &ImagePayload,
    ) -> impl Future<Output = Result<String, CaptionError>> + Send;

    /// Model identifier, used in logs.
    fn model(&self) -> &str;
}

/// Mime type for a supported image extension.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        "heif" => "image/heif",
        _ => return None,
    };
    Some(mime)
}

/// Read an image from disk. Failures here are permanent: retrying will not help.
pub fn read_image(path: &Path) -> Result<ImagePayload, CaptionError> {
    let mime_type = mime_for_path(path)
        .ok_or_else(|| CaptionError::UnsupportedImage(path.display().to_string()))?;
    let bytes = std::fs::read(path).map_err(|e| CaptionError::ImageRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(ImagePayload { bytes, mime_type })
}

/// Pull a human-readable message out of an error body, falling back to the raw text.
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
