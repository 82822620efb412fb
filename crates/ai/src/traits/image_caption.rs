use super::AIModel;
use image::DynamicImage;

#[derive(Debug, Clone)]
pub struct ImageCaptionInput {
    pub image: DynamicImage,
    pub prompt: Option<String>,
}

impl From<DynamicImage> for ImageCaptionInput {
    fn from(image: DynamicImage) -> Self {
        Self {
            image,
            prompt: None,
        }
    }
}

pub type ImageCaptionOutput = String;
pub type ImageCaptionModel = AIModel<ImageCaptionInput, ImageCaptionOutput>;

/// Pipeline stage at which captioning failed.
///
/// Caption models wrap these in `anyhow::Error`; use `downcast_ref` to
/// recover the stage.
#[derive(thiserror::Error, Debug)]
pub enum ImageCaptionError {
    #[error("{0}")]
    Preprocess(String),

    #[error("{0}")]
    Generate(String),
}

impl ImageCaptionError {
    pub fn preprocess<E: std::fmt::Display>(e: E) -> anyhow::Error {
        Self::Preprocess(e.to_string()).into()
    }

    pub fn generate<E: std::fmt::Display>(e: E) -> anyhow::Error {
        Self::Generate(e.to_string()).into()
    }
}
