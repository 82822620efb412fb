use crate::config::ModelConfig;
use ai::{blip::BLIP, AIModel, ImageCaptionModel};

pub fn get_image_caption(config: &ModelConfig) -> anyhow::Result<ImageCaptionModel> {
    let options = config.blip_options();

    let handler = AIModel::new(
        config.model_id(),
        move || {
            let options = options.clone();
            async move { BLIP::new(options).await }
        },
        config.offload_duration,
    )?;

    Ok(handler)
}
