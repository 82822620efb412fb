pub mod ai;
pub mod config;
pub mod error;
pub mod routes;
pub mod standalone;

use ::ai::ImageCaptionModel;

#[derive(Clone)]
pub struct AppState {
    pub image_caption: ImageCaptionModel,
}
