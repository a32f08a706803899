//! Image manipulation contract.
//!
//! The engine itself is pluggable; the gateway only parses options from
//! the query string and hands the bytes over.

use crate::{
    errors::{ApiError, ApiResult},
    services::storage_service::StoreResult,
};
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// 1..=100
    pub quality: Option<u8>,
    pub blur: Option<f32>,
    /// Output format, e.g. `webp`.
    pub format: Option<String>,
}

impl ImageOptions {
    pub fn is_empty(&self) -> bool {
        self.width.is_none()
            && self.height.is_none()
            && self.quality.is_none()
            && self.blur.is_none()
            && self.format.is_none()
    }

    pub fn validate(&self) -> ApiResult<()> {
        if let Some(q) = self.quality {
            if !(1..=100).contains(&q) {
                return Err(ApiError::bad_request("quality must be between 1 and 100")
                    .with_data("q", q));
            }
        }
        if let Some(b) = self.blur {
            if !b.is_finite() || b < 0.0 {
                return Err(ApiError::bad_request("blur must be a positive number"));
            }
        }
        if let Some(format) = &self.format {
            if !matches!(format.as_str(), "jpeg" | "png" | "webp" | "avif" | "auto") {
                return Err(ApiError::bad_request("unsupported output format")
                    .with_data("f", format.clone()));
            }
        }
        Ok(())
    }

    /// MIME type of the output, when the format is forced.
    pub fn output_mime_type(&self) -> Option<String> {
        match self.format.as_deref() {
            None | Some("auto") => None,
            Some(format) => Some(format!("image/{}", format)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformedImage {
    pub content: Bytes,
    pub size: u64,
    /// Quoted etag of the transformed bytes.
    pub etag: String,
}

#[async_trait]
pub trait ImageTransformer: Send + Sync {
    async fn transform(
        &self,
        content: Bytes,
        size: u64,
        options: &ImageOptions,
    ) -> StoreResult<TransformedImage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(ImageOptions::default().is_empty());
        assert!(ImageOptions::default().validate().is_ok());

        let opts = ImageOptions {
            width: Some(100),
            quality: Some(80),
            format: Some("webp".into()),
            ..Default::default()
        };
        assert!(!opts.is_empty());
        assert!(opts.validate().is_ok());
        assert_eq!(opts.output_mime_type().as_deref(), Some("image/webp"));

        let bad = ImageOptions {
            quality: Some(0),
            ..Default::default()
        };
        assert_eq!(bad.validate().unwrap_err().message, "quality must be between 1 and 100");

        let bad = ImageOptions {
            format: Some("bmp".into()),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
