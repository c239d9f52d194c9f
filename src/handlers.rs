use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use actix_multipart::Multipart;
use actix_web::{http::StatusCode, web, HttpResponse};
use futures_util::StreamExt;
use image::io::Reader as ImageReader;
use image::{DynamicImage, GenericImageView};
use tempfile::Builder;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{ErrorKind, PredictError};
use crate::models::{HealthResponse, PredictionResponse};
use crate::normalize::normalize;
use crate::provider::InferenceProvider;

/// Multipart field names accepted for the image, in the order clients use them.
const UPLOAD_FIELDS: [&str; 2] = ["file", "imageFile"];

pub struct AppState {
    /// `None` when the model failed to load at startup.
    pub provider: Option<Arc<dyn InferenceProvider>>,
    pub settings: Settings,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/predict").route(web::post().to(predict)))
        .service(web::resource("/ping").route(web::get().to(ping)));
}

pub async fn ping(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        model_loaded: state.provider.is_some(),
    })
}

pub async fn predict(state: web::Data<AppState>, payload: Multipart) -> HttpResponse {
    let started = Instant::now();
    let strict = state.settings.strict_status;

    let (status, body) = match run_prediction(&state, payload).await {
        Ok(response) => {
            let status = match response.error_type {
                Some(_) if strict => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::OK,
            };
            match &response.error {
                Some(message) => warn!(error = %message, "Could not normalize model output"),
                None => {
                    let top = response
                        .predictions
                        .iter()
                        .max_by(|a, b| a.score().total_cmp(&b.score()))
                        .map(|p| (p.class(), p.score()));
                    info!(
                        predictions = response.predictions.len(),
                        top = ?top,
                        elapsed = ?started.elapsed(),
                        "Prediction completed"
                    )
                }
            }
            (status, response)
        }
        Err(e) => {
            match e.kind() {
                ErrorKind::InputError => warn!(error = %e, "Rejected upload"),
                kind => error!(error = %e, ?kind, "Prediction failed"),
            }
            (error_status(&e, strict), PredictionResponse::failure(&e))
        }
    };

    match serde_json::to_vec(&body) {
        Ok(bytes) => HttpResponse::build(status)
            .content_type("application/json")
            .body(bytes),
        Err(e) => {
            let e = PredictError::Serialization(e.to_string());
            error!(error = %e, "Response serialization failed");
            HttpResponse::build(error_status(&e, strict)).json(PredictionResponse::failure(&e))
        }
    }
}

fn error_status(e: &PredictError, strict: bool) -> StatusCode {
    if !strict {
        return StatusCode::OK;
    }
    match e {
        PredictError::ModelNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
        e if e.kind() == ErrorKind::InputError => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn run_prediction(
    state: &AppState,
    payload: Multipart,
) -> Result<PredictionResponse, PredictError> {
    let provider = state.provider.clone().ok_or(PredictError::ModelNotLoaded)?;
    let settings = &state.settings;

    // Removed together with everything in it when this function returns.
    let mut builder = Builder::new();
    builder.prefix("model-api-upload");
    let upload_dir = match &settings.upload_dir {
        Some(dir) => builder.tempdir_in(dir)?,
        None => builder.tempdir()?,
    };
    let path = save_upload(payload, upload_dir.path(), settings.max_upload_bytes).await?;
    debug!(path = %path.display(), "Saved upload");

    // The scratch file has no extension; the format is sniffed from its bytes.
    let img = web::block(move || -> Result<DynamicImage, PredictError> {
        Ok(ImageReader::open(&path)?.with_guessed_format()?.decode()?)
    })
    .await
    .map_err(|e| PredictError::Storage(e.to_string()))??;
    let (width, height) = img.dimensions();
    info!(width, height, color = ?img.color(), "Loaded image");

    let task = provider.task();
    let inference = web::block(move || provider.predict(&img));
    let output = match actix_rt::time::timeout(settings.timeout, inference).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => return Err(PredictError::Provider(e.to_string())),
        Err(_) => return Err(PredictError::Timeout(settings.timeout)),
    };
    if let Some(output) = &output {
        debug!(raw = %output.describe(), "Model output");
    }

    Ok(normalize(output.as_ref(), settings.normalize_options(task)))
}

/// Streams the first accepted image field into `dir` and returns its path.
/// Other fields are drained and ignored. `limit` bounds the bytes received
/// across all fields, drained ones included.
async fn save_upload(
    mut payload: Multipart,
    dir: &Path,
    limit: usize,
) -> Result<PathBuf, PredictError> {
    let mut saved = None;
    let mut received = 0usize;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| PredictError::Upload(e.to_string()))?;
        let name = field
            .content_disposition()
            .get_name()
            .unwrap_or_default()
            .to_string();

        if saved.is_some() || !UPLOAD_FIELDS.contains(&name.as_str()) {
            debug!(field = %name, "Skipping multipart field");
            while let Some(chunk) = field.next().await {
                let data = chunk.map_err(|e| PredictError::Upload(e.to_string()))?;
                received += data.len();
                if received > limit {
                    return Err(PredictError::UploadTooLarge(limit));
                }
            }
            continue;
        }

        let filepath = dir.join(format!("{}.upload", Uuid::new_v4()));
        let filepath_for_closure = filepath.clone();
        let mut f = web::block(move || File::create(&filepath_for_closure))
            .await
            .map_err(|e| PredictError::Storage(e.to_string()))??;

        while let Some(chunk) = field.next().await {
            let data = chunk.map_err(|e| PredictError::Upload(e.to_string()))?;
            received += data.len();
            if received > limit {
                return Err(PredictError::UploadTooLarge(limit));
            }
            f = web::block(move || f.write_all(&data).map(|_| f))
                .await
                .map_err(|e| PredictError::Storage(e.to_string()))??;
        }
        saved = Some(filepath);
    }

    saved.ok_or(PredictError::NoFile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    use actix_web::{http::header, test, App};
    use image::{ImageOutputFormat, RgbImage};
    use serde_json::{json, Value};

    use crate::models::{Boxes, ClassNames, DetectionMode, ModelOutput, Probs, TaskKind};

    struct StaticProvider {
        task: Option<TaskKind>,
        output: Option<ModelOutput>,
    }

    impl InferenceProvider for StaticProvider {
        fn task(&self) -> Option<TaskKind> {
            self.task
        }

        fn predict(&self, _image: &DynamicImage) -> Result<Option<ModelOutput>, PredictError> {
            Ok(self.output.clone())
        }
    }

    struct FailingProvider;

    impl InferenceProvider for FailingProvider {
        fn task(&self) -> Option<TaskKind> {
            None
        }

        fn predict(&self, _image: &DynamicImage) -> Result<Option<ModelOutput>, PredictError> {
            Err(PredictError::Provider("corrupt model".into()))
        }
    }

    struct SlowProvider;

    impl InferenceProvider for SlowProvider {
        fn task(&self) -> Option<TaskKind> {
            None
        }

        fn predict(&self, _image: &DynamicImage) -> Result<Option<ModelOutput>, PredictError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(None)
        }
    }

    /// Answers "no results" only if the upload is on disk in `dir` while
    /// inference runs.
    struct ScratchWatcher {
        dir: PathBuf,
    }

    impl InferenceProvider for ScratchWatcher {
        fn task(&self) -> Option<TaskKind> {
            None
        }

        fn predict(&self, _image: &DynamicImage) -> Result<Option<ModelOutput>, PredictError> {
            let uploads = walk(&self.dir);
            if uploads == 1 {
                Ok(None)
            } else {
                Err(PredictError::Provider(format!("{} files in scratch dir", uploads)))
            }
        }
    }

    /// Counts regular files below `dir`.
    fn walk(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(&path)
                } else {
                    1
                }
            })
            .sum()
    }

    fn settings() -> Settings {
        Settings {
            mode: DetectionMode::BestPerClass,
            task: None,
            timeout: Duration::from_secs(5),
            max_upload_bytes: 1024 * 1024,
            upload_dir: None,
            strict_status: false,
        }
    }

    fn cat_dog() -> ClassNames {
        [(0, "cat".to_string()), (1, "dog".to_string())].into_iter().collect()
    }

    fn classifier() -> Arc<dyn InferenceProvider> {
        Arc::new(StaticProvider {
            task: Some(TaskKind::Classify),
            output: Some(ModelOutput::classification(
                cat_dog(),
                Probs::Distribution(vec![0.2, 0.8].into()),
            )),
        })
    }

    fn encode(format: ImageOutputFormat) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
            .write_to(&mut bytes, format)
            .unwrap();
        bytes.into_inner()
    }

    fn png() -> Vec<u8> {
        encode(ImageOutputFormat::Png)
    }

    fn multipart(parts: &[(&str, &[u8])]) -> (String, Vec<u8>) {
        let boundary = "model-api-test-boundary";
        let mut body = Vec::new();
        for (field, data) in parts {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"upload.png\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        (format!("multipart/form-data; boundary={boundary}"), body)
    }

    async fn post(
        provider: Option<Arc<dyn InferenceProvider>>,
        settings: Settings,
        field: &str,
        data: &[u8],
    ) -> (StatusCode, Value) {
        post_form(provider, settings, &[(field, data)]).await
    }

    async fn post_form(
        provider: Option<Arc<dyn InferenceProvider>>,
        settings: Settings,
        parts: &[(&str, &[u8])],
    ) -> (StatusCode, Value) {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState { provider, settings }))
                .configure(configure),
        )
        .await;
        let (content_type, body) = multipart(parts);
        let req = test::TestRequest::post()
            .uri("/predict")
            .insert_header((header::CONTENT_TYPE, content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        let status = resp.status();
        let body: Value = test::read_body_json(resp).await;
        (status, body)
    }

    #[actix_web::test]
    async fn classification_upload_returns_every_class() {
        let (status, body) = post(Some(classifier()), settings(), "file", &png()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "predictions": [
                    {"class": "cat", "probability": 0.2},
                    {"class": "dog", "probability": 0.8}
                ],
                "error": null
            })
        );
    }

    #[actix_web::test]
    async fn image_file_field_and_per_box_detection() {
        let provider = Arc::new(StaticProvider {
            task: Some(TaskKind::Detect),
            output: Some(ModelOutput::detection(
                cat_dog(),
                Boxes {
                    cls: vec![1.0, 1.0].into(),
                    conf: vec![0.9, 0.4].into(),
                    xyxyn: vec![0.1, 0.1, 0.5, 0.5, 0.2, 0.2, 0.6, 0.6].into(),
                },
            )),
        });
        let per_box = Settings {
            mode: DetectionMode::PerBox,
            ..settings()
        };
        let (status, body) = post(Some(provider), per_box, "imageFile", &png()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["predictions"].as_array().unwrap().len(), 2);
        assert_eq!(
            body["predictions"][0],
            json!({"class": "dog", "confidence": 0.9, "box": [0.1, 0.1, 0.5, 0.5]})
        );
    }

    #[actix_web::test]
    async fn unreadable_image_still_answers_200() {
        let (status, body) = post(Some(classifier()), settings(), "file", b"not an image").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["predictions"], json!([]));
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Could not load image: "));
        assert_eq!(body["error_type"], "InputError");
    }

    #[actix_web::test]
    async fn strict_status_maps_error_kinds() {
        let strict = Settings {
            strict_status: true,
            ..settings()
        };
        let (status, _) = post(Some(classifier()), strict.clone(), "file", b"garbage").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post(Some(Arc::new(FailingProvider)), strict.clone(), "file", &png()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Error during prediction: corrupt model");

        let (status, body) = post(None, strict, "file", &png()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Model not loaded.");
    }

    #[actix_web::test]
    async fn missing_file_field_is_reported() {
        let (status, body) = post(Some(classifier()), settings(), "avatar", &png()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["predictions"], json!([]));
        assert_eq!(
            body["error"],
            "No file provided. Please upload an image file using 'file' or 'imageFile' parameter."
        );
    }

    #[actix_web::test]
    async fn provider_without_results_is_no_results() {
        let provider = Arc::new(StaticProvider {
            task: None,
            output: None,
        });
        let (_, body) = post(Some(provider), settings(), "file", &png()).await;
        assert_eq!(body["error"], "no results");
        assert_eq!(body["predictions"], json!([]));
    }

    #[actix_web::test]
    async fn slow_inference_times_out() {
        let quick = Settings {
            timeout: Duration::from_millis(50),
            ..settings()
        };
        let (status, body) = post(Some(Arc::new(SlowProvider)), quick, "file", &png()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error_type"], "ProviderError");
        assert!(body["error"].as_str().unwrap().starts_with("Inference timed out"));
    }

    #[actix_web::test]
    async fn oversized_upload_is_rejected() {
        let tiny = Settings {
            max_upload_bytes: 16,
            ..settings()
        };
        let (_, body) = post(Some(classifier()), tiny, "file", &png()).await;
        assert_eq!(body["error"], "Upload exceeds the limit of 16 bytes");
    }

    #[actix_web::test]
    async fn ignored_fields_count_towards_the_upload_limit() {
        let image = png();
        let filler = vec![b'x'; 256];
        let limit = Settings {
            max_upload_bytes: image.len() + 64,
            ..settings()
        };

        let (_, body) = post(Some(classifier()), limit.clone(), "file", &image).await;
        assert_eq!(body["error"], Value::Null);

        let parts: [(&str, &[u8]); 2] = [("comment", &filler), ("file", &image)];
        let (_, body) = post_form(Some(classifier()), limit.clone(), &parts).await;
        assert_eq!(
            body["error"],
            format!("Upload exceeds the limit of {} bytes", limit.max_upload_bytes)
        );
        assert_eq!(body["error_type"], "InputError");
    }

    #[actix_web::test]
    async fn jpeg_upload_is_decoded_from_its_content() {
        let jpeg = encode(ImageOutputFormat::Jpeg(90));
        let (status, body) = post(Some(classifier()), settings(), "file", &jpeg).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], Value::Null);
        assert_eq!(body["predictions"].as_array().unwrap().len(), 2);
    }

    #[actix_web::test]
    async fn scratch_files_are_removed_on_every_exit_path() {
        let scratch = tempfile::tempdir().unwrap();
        let in_scratch = Settings {
            upload_dir: Some(scratch.path().to_path_buf()),
            timeout: Duration::from_millis(100),
            ..settings()
        };
        let watcher: Arc<dyn InferenceProvider> = Arc::new(ScratchWatcher {
            dir: scratch.path().to_path_buf(),
        });

        let cases: Vec<(Arc<dyn InferenceProvider>, Vec<u8>, &str)> = vec![
            (watcher, png(), "no results"),
            (classifier(), b"not an image".to_vec(), "Could not load image: "),
            (
                Arc::new(FailingProvider) as Arc<dyn InferenceProvider>,
                png(),
                "Error during prediction: corrupt model",
            ),
            (Arc::new(SlowProvider) as Arc<dyn InferenceProvider>, png(), "Inference timed out"),
        ];
        for (provider, data, expected) in cases {
            let (_, body) = post(Some(provider), in_scratch.clone(), "file", &data).await;
            assert!(
                body["error"].as_str().unwrap().starts_with(expected),
                "unexpected body {}",
                body
            );
            assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        }
    }

    #[actix_web::test]
    async fn storage_failures_are_server_errors() {
        let root = tempfile::tempdir().unwrap();
        let strict = Settings {
            upload_dir: Some(root.path().join("gone")),
            strict_status: true,
            ..settings()
        };
        let (status, body) = post(Some(classifier()), strict, "file", &png()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error_type"], "ProviderError");
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Could not store upload: "));
    }

    #[actix_web::test]
    async fn ping_reports_model_state() {
        for (provider, loaded) in [(Some(classifier()), true), (None, false)] {
            let app = test::init_service(
                App::new()
                    .app_data(web::Data::new(AppState {
                        provider,
                        settings: settings(),
                    }))
                    .configure(configure),
            )
            .await;
            let req = test::TestRequest::get().uri("/ping").to_request();
            let body: Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body, json!({"status": "ok", "model_loaded": loaded}));
        }
    }
}
