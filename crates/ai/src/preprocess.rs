use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};

pub const BLIP_IMAGE_SIZE: u32 = 384;
pub const BLIP_IMAGE_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const BLIP_IMAGE_STD: [f32; 3] = [0.26862954, 0.261_302_6, 0.275_777_1];

/// Turn an image into a normalized `(3, size, size)` f32 tensor.
pub fn image_to_tensor(
    image: &DynamicImage,
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
    device: &Device,
) -> candle_core::Result<Tensor> {
    if image.width() == 0 || image.height() == 0 {
        candle_core::bail!(
            "invalid image dimensions {}x{}",
            image.width(),
            image.height()
        );
    }

    let img = image
        .resize_exact(size, size, FilterType::CatmullRom)
        .to_rgb8();
    let data = img.into_raw();
    let data = Tensor::from_vec(data, (size as usize, size as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?;
    let mean = Tensor::new(&mean, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&std, &Device::Cpu)?.reshape((3, 1, 1))?;

    (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?
        .to_device(device)
}
