#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod loader;
mod traits;

pub mod blip;
pub mod generation;
pub mod hub;
pub mod preprocess;
pub mod utils;

pub use image;
pub use tokenizers;
pub use traits::*;

use tokio::sync::oneshot;

pub type HandlerPayload<TItem, TOutput> = (
    Vec<TItem>,
    oneshot::Sender<anyhow::Result<Vec<anyhow::Result<TOutput>>>>,
);
