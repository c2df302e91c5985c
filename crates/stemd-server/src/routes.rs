//! HTTP routes: health, job submission, status, result download, and
//! cancellation.

use std::io::Write as _;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;

use stemd_core::job::{JobRequest, JobStatus};
use stemd_core::service::Service;

use crate::registry::JobRegistry;

/// Uploads beyond this size are rejected with 413.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    /// None while the service failed to come up; requests answer 503.
    pub service: Option<Arc<Service>>,
    pub registry: Arc<JobRegistry>,
    pub output_root: PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(job_status).delete(cancel_job))
        .route("/jobs/:id/download", get(download_job))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({ "message": "stemd separation job server" }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn submit_job(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let Some(service) = state.service.clone() else {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "service not ready");
    };

    let mut upload: Option<(String, Vec<u8>)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                let filename = field.file_name().map(str::to_string).unwrap_or_default();
                match field.bytes().await {
                    Ok(bytes) => {
                        upload = Some((filename, bytes.to_vec()));
                        break;
                    }
                    Err(e) => {
                        return error_body(
                            e.status(),
                            &format!("failed to read upload: {}", e.body_text()),
                        )
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                return error_body(
                    e.status(),
                    &format!("malformed multipart body: {}", e.body_text()),
                )
            }
        }
    }

    let Some((filename, data)) = upload else {
        return error_body(StatusCode::BAD_REQUEST, "file field required");
    };
    if !filename.to_ascii_lowercase().ends_with(".wav") {
        return error_body(StatusCode::BAD_REQUEST, "WAV input required");
    }

    let job_id = state.registry.next_id();
    let uploads_dir = state.output_root.join("uploads");
    let safe_name = FsPath::new(&filename)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.wav".to_string());
    let target_path = uploads_dir.join(format!("{}-{}", job_id, safe_name));

    if let Err(e) = tokio::fs::create_dir_all(&uploads_dir).await {
        log::error!("submit_job: failed to prepare upload dir: {}", e);
        return error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to prepare upload dir",
        );
    }
    if let Err(e) = tokio::fs::write(&target_path, &data).await {
        log::error!("submit_job: failed to save upload: {}", e);
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, "failed to save upload");
    }

    let registry = Arc::clone(&state.registry);
    let observer_id = job_id.clone();
    let mut request = JobRequest::new(&target_path);
    request.observer = Some(Arc::new(move |descriptor, event| {
        registry.update(&observer_id, descriptor, event);
    }));

    // submit touches the filesystem (existence check) and the pool
    // lock, so keep it off the async workers.
    let submitted =
        tokio::task::spawn_blocking(move || service.submit(request)).await;

    match submitted {
        Ok(Ok(handle)) => {
            state.registry.add(&job_id, handle, target_path);
            log::info!("submit_job: accepted job {} ({})", job_id, filename);
            (StatusCode::ACCEPTED, Json(json!({ "id": job_id }))).into_response()
        }
        Ok(Err(e)) => {
            tokio::fs::remove_file(&target_path).await.ok();
            error_body(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e) => {
            log::error!("submit_job: submission task failed: {}", e);
            tokio::fs::remove_file(&target_path).await.ok();
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "submission failed")
        }
    }
}

async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(job) = state.registry.get(&id) else {
        return error_body(StatusCode::NOT_FOUND, "job not found");
    };

    let mut body = json!({
        "id": id,
        "status": job.last_event.status.as_str(),
        "progress": job.last_event.progress,
    });
    if !job.output_dir.as_os_str().is_empty() {
        body["output_dir"] = json!(job.output_dir.to_string_lossy());
    }
    if let Some(error) = &job.last_event.error {
        body["error"] = json!(error);
    }
    (StatusCode::OK, Json(body)).into_response()
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(job) = state.registry.get(&id) else {
        return error_body(StatusCode::NOT_FOUND, "job not found");
    };

    match job.handle.cancel("Cancelled via API") {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "id": id, "status": "cancelling" })))
            .into_response(),
        Err(e) => error_body(StatusCode::CONFLICT, &e.to_string()),
    }
}

async fn download_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(job) = state.registry.get(&id) else {
        return error_body(StatusCode::NOT_FOUND, "job not found");
    };
    if job.last_event.status != JobStatus::Completed {
        return error_body(StatusCode::CONFLICT, "job not completed");
    }
    if job.output_dir.as_os_str().is_empty() {
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, "missing output path");
    }

    let dir = job.output_dir.clone();
    let archive = tokio::task::spawn_blocking(move || zip_directory(&dir)).await;

    match archive {
        Ok(Ok(bytes)) => {
            let archive_name = job
                .output_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.clone());
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/zip".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{}.zip\"", archive_name),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        Ok(Err(e)) => {
            log::error!("download_job: packaging failed for {}: {}", id, e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "failed to package output")
        }
        Err(e) => {
            log::error!("download_job: packaging task failed: {}", e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "failed to package output")
        }
    }
}

/// Flat zip of every regular file in `dir`.
fn zip_directory(dir: &FsPath) -> std::io::Result<Vec<u8>> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut archive = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            archive
                .start_file(name, options)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            let bytes = std::fs::read(&path)?;
            archive.write_all(&bytes)?;
        }
        archive
            .finish()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tower::util::ServiceExt;

    fn empty_state() -> AppState {
        AppState {
            service: None,
            registry: Arc::new(JobRegistry::new()),
            output_root: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = router(empty_state())
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let response = router(empty_state())
            .oneshot(
                axum::http::Request::builder()
                    .uri("/jobs/99")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_without_service_is_503() {
        let body = concat!(
            "--boundary\r\n",
            "Content-Disposition: form-data; name=\"file\"; filename=\"a.wav\"\r\n",
            "\r\n",
            "data\r\n",
            "--boundary--\r\n"
        );
        let response = router(empty_state())
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "multipart/form-data; boundary=boundary")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_zip_directory_contains_files() {
        let dir = std::env::temp_dir().join(format!("stemd-zip-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vocals.wav"), b"wav-bytes").unwrap();
        fs::write(dir.join("drums.wav"), b"wav-bytes").unwrap();

        let bytes = zip_directory(&dir).unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["drums.wav", "vocals.wav"]);

        fs::remove_dir_all(&dir).ok();
    }
}
