use crate::{error::ApiError, AppState};
use ai::{
    image::{self, DynamicImage},
    ImageCaptionError, ImageCaptionInput,
};
use axum::{
    body::Bytes,
    extract::{Multipart, State},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CaptionResponse {
    pub caption: String,
}

impl CaptionResponse {
    fn failure(stage: &str, e: impl std::fmt::Display) -> Self {
        Self {
            caption: format!("{}: {}", stage, e),
        }
    }

    fn from_pipeline_error(e: anyhow::Error) -> Self {
        match e.downcast_ref::<ImageCaptionError>() {
            Some(ImageCaptionError::Preprocess(msg)) => {
                Self::failure("Error processing image features", msg)
            }
            Some(ImageCaptionError::Generate(msg)) => {
                Self::failure("Error generating caption", msg)
            }
            None => Self::failure("Error generating caption", format!("{:#}", e)),
        }
    }
}

struct Upload {
    image: Bytes,
    prompt: Option<String>,
}

async fn read_upload(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    let mut image = None;
    let mut prompt = None;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("image") => image = Some(field.bytes().await?),
            Some("prompt") => prompt = Some(field.text().await?),
            name => tracing::debug!("ignoring form field {:?}", name),
        }
    }

    Ok(Upload {
        image: image.ok_or(ApiError::MissingField("image"))?,
        prompt,
    })
}

async fn decode_image(data: Bytes) -> anyhow::Result<DynamicImage> {
    let img = tokio::task::spawn_blocking(move || image::load_from_memory(&data)).await??;
    Ok(DynamicImage::ImageRgb8(img.into_rgb8()))
}

#[tracing::instrument(skip_all)]
pub(super) async fn generate_caption(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<CaptionResponse>, ApiError> {
    let upload = read_upload(&mut multipart).await?;
    tracing::debug!("received image of {} bytes", upload.image.len());

    let image = match decode_image(upload.image).await {
        Ok(image) => image,
        Err(e) => {
            tracing::error!("failed to decode image: {:#}", e);
            return Ok(Json(CaptionResponse::failure("Error processing image", e)));
        }
    };

    let input = ImageCaptionInput {
        image,
        prompt: upload.prompt,
    };

    match state.image_caption.process_single(input).await {
        Ok(caption) => {
            tracing::info!("caption generated: {}", caption);
            Ok(Json(CaptionResponse { caption }))
        }
        Err(e) => {
            tracing::error!("failed to generate caption: {:#}", e);
            Ok(Json(CaptionResponse::from_pipeline_error(e)))
        }
    }
}

#[cfg(test)]
mod test {
    use super::CaptionResponse;
    use crate::{routes::get_routes, AppState};
    use ai::{
        image::{DynamicImage, ImageFormat},
        AIModel, ImageCaptionError, ImageCaptionInput, Model,
    };
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use std::io::Cursor;
    use tower::ServiceExt;

    const BOUNDARY: &str = "caption-test-boundary";

    struct FakeCaptioner;

    impl Model for FakeCaptioner {
        type Item = ImageCaptionInput;
        type Output = String;

        fn batch_size_limit(&self) -> usize {
            1
        }

        async fn process(
            &mut self,
            items: Vec<Self::Item>,
        ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
            Ok(items
                .into_iter()
                .map(|item| match item.prompt.as_deref() {
                    Some("fail-preprocess") => Err(ImageCaptionError::preprocess("bad pixels")),
                    Some("fail-generate") => Err(ImageCaptionError::generate("decoder exploded")),
                    Some("fail-other") => Err(anyhow::anyhow!("worker gone")),
                    prompt => Ok(format!(
                        "{}a {}x{} picture",
                        prompt.map(|p| format!("{} ", p)).unwrap_or_default(),
                        item.image.width(),
                        item.image.height()
                    )),
                })
                .collect())
        }
    }

    fn app(body_limit: usize) -> Router {
        let image_caption = AIModel::new("fake".into(), || async { Ok(FakeCaptioner) }, None)
            .expect("create fake model");
        get_routes(AppState { image_caption }, body_limit)
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = vec![];
        DynamicImage::new_rgb8(width, height)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn multipart_request(parts: &[(&str, &[u8])]) -> Request<Body> {
        let mut body = vec![];
        for (name, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            if *name == "image" {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"upload.png\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        name
                    )
                    .as_bytes(),
                );
            } else {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/caption")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn caption_for(parts: &[(&str, &[u8])]) -> String {
        let (status, body) = send(app(1024 * 1024), multipart_request(parts)).await;
        assert_eq!(status, StatusCode::OK);
        let response: CaptionResponse = serde_json::from_value(body).unwrap();
        response.caption
    }

    #[test_log::test(tokio::test)]
    async fn test_caption() {
        let image = png(8, 6);
        assert_eq!(caption_for(&[("image", &image[..])]).await, "a 8x6 picture");
        assert_eq!(
            caption_for(&[("prompt", &b"a photo of"[..]), ("image", &image[..])]).await,
            "a photo of a 8x6 picture"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_undecodable_image() {
        let caption = caption_for(&[("image", &b"definitely not an image"[..])]).await;
        assert!(caption.starts_with("Error processing image: "), "{}", caption);

        let caption = caption_for(&[("image", &b""[..])]).await;
        assert!(caption.starts_with("Error processing image: "), "{}", caption);
    }

    #[test_log::test(tokio::test)]
    async fn test_pipeline_errors_are_reported_as_caption() {
        let image = png(4, 4);
        assert_eq!(
            caption_for(&[("image", &image[..]), ("prompt", &b"fail-preprocess"[..])]).await,
            "Error processing image features: bad pixels"
        );
        assert_eq!(
            caption_for(&[("image", &image[..]), ("prompt", &b"fail-generate"[..])]).await,
            "Error generating caption: decoder exploded"
        );
        assert_eq!(
            caption_for(&[("image", &image[..]), ("prompt", &b"fail-other"[..])]).await,
            "Error generating caption: worker gone"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_image_field() {
        let (status, body) = send(
            app(1024 * 1024),
            multipart_request(&[("file", &png(4, 4)[..])]),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["detail"], "field required: image");
    }

    #[test_log::test(tokio::test)]
    async fn test_body_limit() {
        let (status, body) = send(app(1024), multipart_request(&[("image", &[0u8; 4096][..])])).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body["detail"].is_string());
    }

    #[test_log::test(tokio::test)]
    async fn test_root_and_cors() {
        let response = app(1024)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );

        let preflight = app(1024)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/caption")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(preflight.status().is_success());
        assert_eq!(
            preflight.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }
}
