//! HTTP and WebSocket surface
//!
//! REST handles one-shot reads and edits; the WebSocket channel carries
//! live traffic per session: JSON control events as text frames and CBOR
//! replication ops as binary frames. Both surfaces funnel every edit
//! through the same coordinator path.

mod ws;

use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::error::EngineError;
use crate::model::{Direction, ModelError, Violation};
use crate::sync::{Mutation, SyncCoordinator};

#[derive(Debug, Serialize)]
struct ApiResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<Violation>,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            warnings: Vec::new(),
        }
    }

    fn ok_with_warnings(message: impl Into<String>, warnings: Vec<Violation>) -> Self {
        Self {
            success: true,
            message: message.into(),
            warnings,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateApplicationRequest {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct CreateTopicRequest {
    app: String,
    name: String,
    proto: String,
    direction: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    backup_name: String,
}

/// Compose the full route tree. The caller passes it to `warp::serve`.
pub fn routes(
    engine: Arc<SyncCoordinator>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let api = warp::path("api");

    let get_document = api
        .and(warp::path("document"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_get_document);

    let get_applications = api
        .and(warp::path("applications"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_get_applications);

    let create_application = api
        .and(warp::path("applications"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_create_application);

    let delete_application = api
        .and(warp::path("applications"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_delete_application);

    let create_topic = api
        .and(warp::path("topics"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_create_topic);

    let delete_topic = api
        .and(warp::path("applications"))
        .and(warp::path::param::<String>())
        .and(warp::path("topics"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_delete_topic);

    let save = api
        .and(warp::path("save"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_save);

    let get_files = api
        .and(warp::path("files"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_get_files);

    let delete_file = api
        .and(warp::path("files"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_delete_file);

    let get_backups = api
        .and(warp::path("backups"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_get_backups);

    let get_storage = api
        .and(warp::path("storage"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_get_storage);

    let get_status = api
        .and(warp::path("status"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_get_status);

    let restore = api
        .and(warp::path("restore"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(handle_restore);

    let websocket = warp::path("ws")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_engine(engine))
        .map(|session_id: String, ws: warp::ws::Ws, engine: Arc<SyncCoordinator>| {
            ws.on_upgrade(move |socket| ws::handle_session(socket, session_id, engine))
        });

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST", "DELETE"]);

    get_document
        .or(get_applications)
        .or(create_application)
        .or(delete_application)
        .or(create_topic)
        .or(delete_topic)
        .or(save)
        .or(get_files)
        .or(delete_file)
        .or(get_backups)
        .or(get_storage)
        .or(get_status)
        .or(restore)
        .or(websocket)
        .with(cors)
}

/// Bind and serve until the process exits.
pub async fn serve(engine: Arc<SyncCoordinator>, port: u16) {
    log::info!("Listening on http://0.0.0.0:{}", port);
    warp::serve(routes(engine)).run(([0, 0, 0, 0], port)).await;
}

fn with_engine(
    engine: Arc<SyncCoordinator>,
) -> impl Filter<Extract = (Arc<SyncCoordinator>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&engine))
}

fn engine_error_reply(err: EngineError) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = match &err {
        EngineError::Model(ModelError::ApplicationNotFound(_))
        | EngineError::Model(ModelError::TopicNotFound { .. }) => StatusCode::NOT_FOUND,
        EngineError::Model(ModelError::DuplicateApplication(_))
        | EngineError::Model(ModelError::DuplicateTopic { .. }) => StatusCode::CONFLICT,
        EngineError::Model(ModelError::InvalidDirection(_)) | EngineError::Xml(_) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::Storage(crate::storage::StorageError::BackupMissing(_))
        | EngineError::Storage(crate::storage::StorageError::SnapshotMissing(_)) => {
            StatusCode::NOT_FOUND
        }
        EngineError::Storage(crate::storage::StorageError::InvalidName(_)) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warp::reply::with_status(warp::reply::json(&ApiResponse::fail(err.to_string())), status)
}

fn storage_error_reply(err: crate::storage::StorageError) -> warp::reply::WithStatus<warp::reply::Json> {
    engine_error_reply(EngineError::Storage(err))
}

async fn handle_get_document(engine: Arc<SyncCoordinator>) -> Result<impl Reply, warp::Rejection> {
    let document = engine.document().await;
    Ok(warp::reply::json(&document))
}

async fn handle_get_applications(
    engine: Arc<SyncCoordinator>,
) -> Result<impl Reply, warp::Rejection> {
    let document = engine.document().await;
    Ok(warp::reply::json(&document.applications))
}

async fn handle_create_application(
    req: CreateApplicationRequest,
    engine: Arc<SyncCoordinator>,
) -> Result<impl Reply, warp::Rejection> {
    let result = engine
        .apply_mutation(
            None,
            Mutation::AddApplication {
                name: req.name.clone(),
                description: req.description,
            },
        )
        .await;
    Ok(match result {
        Ok(outcome) => warp::reply::with_status(
            warp::reply::json(&ApiResponse::ok_with_warnings(
                format!("Application '{}' created", req.name),
                outcome.warnings,
            )),
            StatusCode::CREATED,
        ),
        Err(e) => engine_error_reply(e),
    })
}

async fn handle_delete_application(
    name: String,
    engine: Arc<SyncCoordinator>,
) -> Result<impl Reply, warp::Rejection> {
    let result = engine
        .apply_mutation(None, Mutation::RemoveApplication { name: name.clone() })
        .await;
    Ok(match result {
        Ok(_) => warp::reply::with_status(
            warp::reply::json(&ApiResponse::ok(format!("Application '{}' removed", name))),
            StatusCode::OK,
        ),
        Err(e) => engine_error_reply(e),
    })
}

async fn handle_create_topic(
    req: CreateTopicRequest,
    engine: Arc<SyncCoordinator>,
) -> Result<impl Reply, warp::Rejection> {
    let direction: Direction = match req.direction.parse() {
        Ok(direction) => direction,
        Err(e) => return Ok(engine_error_reply(EngineError::Model(e))),
    };
    let result = engine
        .apply_mutation(
            None,
            Mutation::AddTopic {
                app: req.app.clone(),
                name: req.name.clone(),
                proto: req.proto,
                direction,
                description: req.description,
            },
        )
        .await;
    Ok(match result {
        Ok(outcome) => warp::reply::with_status(
            warp::reply::json(&ApiResponse::ok_with_warnings(
                format!("Topic '{}' added to '{}'", req.name, req.app),
                outcome.warnings,
            )),
            StatusCode::CREATED,
        ),
        Err(e) => engine_error_reply(e),
    })
}

async fn handle_delete_topic(
    app: String,
    name: String,
    engine: Arc<SyncCoordinator>,
) -> Result<impl Reply, warp::Rejection> {
    let result = engine
        .apply_mutation(
            None,
            Mutation::RemoveTopic {
                app: app.clone(),
                name: name.clone(),
            },
        )
        .await;
    Ok(match result {
        Ok(_) => warp::reply::with_status(
            warp::reply::json(&ApiResponse::ok(format!(
                "Topic '{}' removed from '{}'",
                name, app
            ))),
            StatusCode::OK,
        ),
        Err(e) => engine_error_reply(e),
    })
}

async fn handle_save(engine: Arc<SyncCoordinator>) -> Result<impl Reply, warp::Rejection> {
    Ok(match engine.save_now().await {
        Ok(version) => warp::reply::with_status(
            warp::reply::json(&ApiResponse::ok(format!("Saved at version {}", version))),
            StatusCode::OK,
        ),
        Err(e) => engine_error_reply(e),
    })
}

async fn handle_get_files(engine: Arc<SyncCoordinator>) -> Result<impl Reply, warp::Rejection> {
    Ok(match engine.store().list_snapshots() {
        Ok(files) => warp::reply::with_status(warp::reply::json(&files), StatusCode::OK),
        Err(e) => storage_error_reply(e),
    })
}

async fn handle_delete_file(
    name: String,
    engine: Arc<SyncCoordinator>,
) -> Result<impl Reply, warp::Rejection> {
    Ok(match engine.store().delete_snapshot(&name) {
        Ok(()) => warp::reply::with_status(
            warp::reply::json(&ApiResponse::ok(format!("File '{}' deleted", name))),
            StatusCode::OK,
        ),
        Err(e) => storage_error_reply(e),
    })
}

async fn handle_get_backups(engine: Arc<SyncCoordinator>) -> Result<impl Reply, warp::Rejection> {
    Ok(match engine.store().list_backups() {
        Ok(backups) => warp::reply::with_status(warp::reply::json(&backups), StatusCode::OK),
        Err(e) => storage_error_reply(e),
    })
}

async fn handle_get_storage(engine: Arc<SyncCoordinator>) -> Result<impl Reply, warp::Rejection> {
    Ok(match engine.store().storage_info() {
        Ok(info) => warp::reply::with_status(warp::reply::json(&info), StatusCode::OK),
        Err(e) => storage_error_reply(e),
    })
}

async fn handle_get_status(engine: Arc<SyncCoordinator>) -> Result<impl Reply, warp::Rejection> {
    #[derive(Serialize)]
    struct StatusResponse {
        session_count: usize,
        #[serde(flatten)]
        engine: crate::sync::EngineStatus,
    }
    let status = StatusResponse {
        session_count: engine.sessions().session_count().await,
        engine: engine.status().await,
    };
    Ok(warp::reply::json(&status))
}

async fn handle_restore(
    req: RestoreRequest,
    engine: Arc<SyncCoordinator>,
) -> Result<impl Reply, warp::Rejection> {
    Ok(match engine.restore_backup(&req.backup_name).await {
        Ok(_) => warp::reply::with_status(
            warp::reply::json(&ApiResponse::ok(format!(
                "Restored from '{}'",
                req.backup_name
            ))),
            StatusCode::OK,
        ),
        Err(e) => engine_error_reply(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> Arc<SyncCoordinator> {
        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            debounce_secs: 0,
            ..EngineConfig::default()
        };
        SyncCoordinator::start(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_delete_file_removes_snapshot_with_final_backup() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        engine.store().save_snapshot("spare.xml", "<x/>").unwrap();
        let routes = routes(Arc::clone(&engine));

        let resp = warp::test::request()
            .method("DELETE")
            .path("/api/files/spare.xml")
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!engine.store().snapshot_exists("spare.xml"));
        // The delete took one last backup first.
        assert!(engine
            .store()
            .list_backups()
            .unwrap()
            .iter()
            .any(|b| b.name.starts_with("spare_")));
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let routes = routes(Arc::clone(&engine));

        let resp = warp::test::request()
            .method("DELETE")
            .path("/api/files/absent.xml")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
