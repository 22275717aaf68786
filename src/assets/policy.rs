//! Per-category asset sizing policy
//!
//! The same logical image serves wildly different display sizes: a token
//! on a grid vs. a full-screen scene. Storing and shipping full-resolution
//! bytes for every use would dominate both storage and network cost, so
//! each category carries its own downscale/recompress budget, most
//! aggressive for icon-like categories.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Asset category tag. Determines the recompression budget.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum AssetCategory {
    /// Small grid tokens. Most aggressive policy.
    Token,
    /// Character portraits.
    Portrait,
    /// Handout documents and illustrations.
    Handout,
    /// Full-scene backgrounds and maps. Least aggressive policy.
    Scene,
}

impl AssetCategory {
    pub fn name(&self) -> &'static str {
        match self {
            AssetCategory::Token => "token",
            AssetCategory::Portrait => "portrait",
            AssetCategory::Handout => "handout",
            AssetCategory::Scene => "scene",
        }
    }
}

/// Downscale/recompress budget for one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryPolicy {
    /// Longest-edge cap in pixels.
    pub max_dimension: u32,
    /// Recompression quality, 1-100.
    pub quality: u8,
    /// Longest-edge cap for the derived thumbnail.
    pub thumb_dimension: u32,
    /// Hard byte ceiling after recompression. An asset that still exceeds
    /// this is rejected rather than stored.
    pub max_bytes: usize,
}

impl CategoryPolicy {
    pub fn for_category(category: AssetCategory) -> Self {
        match category {
            AssetCategory::Token => Self {
                max_dimension: 256,
                quality: 60,
                thumb_dimension: 64,
                max_bytes: 256 * 1024,
            },
            AssetCategory::Portrait => Self {
                max_dimension: 512,
                quality: 70,
                thumb_dimension: 128,
                max_bytes: 1024 * 1024,
            },
            AssetCategory::Handout => Self {
                max_dimension: 1024,
                quality: 80,
                thumb_dimension: 192,
                max_bytes: 4 * 1024 * 1024,
            },
            AssetCategory::Scene => Self {
                max_dimension: 2048,
                quality: 85,
                thumb_dimension: 256,
                max_bytes: 12 * 1024 * 1024,
            },
        }
    }
}

/// Output of running an asset through the category policy.
pub struct ProcessedAsset {
    pub bytes: Bytes,
    /// Thumbnail derived at ingest so UI read paths never block on it.
    /// `None` when the transcoder cannot produce one.
    pub thumbnail: Option<Bytes>,
}

/// Pixel-level downscaling and recompression seam.
///
/// Image codecs belong to the rendering layer, not the engine, so the
/// engine takes the transcoder as an injected dependency. The default
/// [`PassthroughTranscoder`] enforces the byte budget and reuses small
/// originals as their own thumbnail.
pub trait ImageTranscoder: Send + Sync + 'static {
    fn process(&self, bytes: &Bytes, policy: &CategoryPolicy) -> Result<ProcessedAsset, EngineError>;
}

/// Byte-budget-only transcoder. Does not decode pixels.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTranscoder;

/// Originals at or below this size double as their own thumbnail.
const THUMB_BYTE_BUDGET: usize = 64 * 1024;

impl ImageTranscoder for PassthroughTranscoder {
    fn process(&self, bytes: &Bytes, policy: &CategoryPolicy) -> Result<ProcessedAsset, EngineError> {
        if bytes.len() > policy.max_bytes {
            return Err(EngineError::AssetIo(format!(
                "asset of {} bytes exceeds category budget of {} bytes",
                bytes.len(),
                policy.max_bytes
            )));
        }
        let thumbnail = if bytes.len() <= THUMB_BYTE_BUDGET {
            Some(bytes.clone())
        } else {
            None
        };
        Ok(ProcessedAsset {
            bytes: bytes.clone(),
            thumbnail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_policy_is_most_aggressive() {
        let token = CategoryPolicy::for_category(AssetCategory::Token);
        let scene = CategoryPolicy::for_category(AssetCategory::Scene);
        assert!(token.max_dimension < scene.max_dimension);
        assert!(token.quality < scene.quality);
        assert!(token.max_bytes < scene.max_bytes);
    }

    #[test]
    fn passthrough_rejects_over_budget() {
        let policy = CategoryPolicy::for_category(AssetCategory::Token);
        let big = Bytes::from(vec![0u8; policy.max_bytes + 1]);
        assert!(PassthroughTranscoder.process(&big, &policy).is_err());
    }

    #[test]
    fn small_original_doubles_as_thumbnail() {
        let policy = CategoryPolicy::for_category(AssetCategory::Token);
        let small = Bytes::from_static(b"tiny png");
        let out = PassthroughTranscoder.process(&small, &policy).unwrap();
        assert_eq!(out.thumbnail.unwrap(), small);
    }
}
