//! Downstream media generation seams. The knowledge base feeds portrait,
//! audio and video production; none of those backends ship yet, only the
//! interfaces they will implement.

use crate::core::chapter::Chapter;
use crate::core::character::Character;
use anyhow::Result;
use async_trait::async_trait;

/// Renders a portrait image from a character's standardized features.
#[async_trait]
pub trait PortraitGenerator: Send + Sync {
    async fn generate(&self, character: &Character, style: &str) -> Result<Vec<u8>>;
}

/// Narrates chapter text to audio.
#[async_trait]
pub trait AudioSynthesizer: Send + Sync {
    async fn synthesize(&self, chapter: &Chapter, voice: &str) -> Result<Vec<u8>>;
}

/// Composes narrated chapters and portraits into video.
#[async_trait]
pub trait VideoComposer: Send + Sync {
    async fn compose(&self, chapters: &[Chapter], characters: &[Character]) -> Result<Vec<u8>>;
}
