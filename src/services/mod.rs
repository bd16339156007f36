//! External collaborators invoked by the consistency pipeline.
//!
//! The text-extraction model, the image-diffusion model and the vision
//! captioner are opaque services. Each is reached through an async trait so
//! deployments can plug in HTTP clients, local models or test fakes.
//! Timeouts are the implementation's responsibility; any error returned
//! here is converted into a session outcome by the controller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pald::PaldDocument;

/// Turns free text into a raw, unvalidated PALD candidate.
///
/// The returned value may be nested or flat; the pipeline flattens it and
/// filters it through the schema.
#[async_trait]
pub trait PaldExtractor: Send + Sync {
    async fn extract_pald(&self, text: &str) -> Result<Value, anyhow::Error>;
}

/// Request passed to the image generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Attributes to render. Always derived from the session's input
    /// document, never from a description-derived one.
    pub pald: PaldDocument,
    /// Free-text advisory hint from user feedback, if any.
    pub hint: Option<String>,
    /// 1-based consistency iteration this request belongs to.
    pub iteration: u32,
}

/// Result reported by the image generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub success: bool,
    pub image_ref: Option<String>,
    pub error: Option<String>,
}

impl GenerationResult {
    pub fn ok(image_ref: impl Into<String>) -> Self {
        Self {
            success: true,
            image_ref: Some(image_ref.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            image_ref: None,
            error: Some(error.into()),
        }
    }
}

/// Renders an image from PALD attributes.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, anyhow::Error>;
}

/// Free-text caption of a generated image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDescription {
    pub description_text: String,
}

/// Captions a generated image.
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe_image(&self, image_ref: &str) -> Result<ImageDescription, anyhow::Error>;
}
