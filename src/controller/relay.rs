use std::collections::HashSet;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, OriginalUri, Path, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Uri};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use cyder_tools::log::{debug, error};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::database::ability::Ability;
use crate::relay::error::RelayError;
use crate::relay::executor::{relay, RelayInput};
use crate::relay::meta::RelayMode;
use crate::relay::model::{GeneralOpenAIRequest, ModelObject};
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::utils::auth::{token_auth_middleware, AuthContext};
use crate::utils::limit::{global_relay_rate_limit, upload_rate_limit};
use crate::utils::request_id::RequestId;

const MAX_RELAY_BODY: usize = 32 * 1024 * 1024;

fn default_model(mode: RelayMode) -> &'static str {
    match mode {
        RelayMode::ImagesGenerations | RelayMode::ImagesEdits => "dall-e-2",
        RelayMode::Moderations => "text-moderation-stable",
        RelayMode::AudioTranscription | RelayMode::AudioTranslation => "whisper-1",
        RelayMode::AudioSpeech => "tts-1",
        _ => "",
    }
}

/// Reads the billing-relevant fields out of a multipart form. The form
/// itself is forwarded byte for byte.
async fn parse_multipart(content_type: &str, body: Bytes) -> Result<GeneralOpenAIRequest, RelayError> {
    let request = Request::builder()
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .map_err(|e| RelayError::invalid_request(e.to_string()))?;
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| RelayError::invalid_request(format!("invalid multipart body: {}", e)))?;

    let mut parsed = GeneralOpenAIRequest::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::invalid_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if !matches!(name.as_str(), "model" | "size" | "n" | "quality" | "prompt") {
            continue;
        }
        let value = field
            .text()
            .await
            .map_err(|e| RelayError::invalid_request(format!("invalid field {}: {}", name, e)))?;
        match name.as_str() {
            "model" => parsed.model = value,
            "size" => parsed.size = Some(value),
            "quality" => parsed.quality = Some(value),
            "prompt" => parsed.prompt = Some(serde_json::Value::String(value)),
            "n" => {
                parsed.n = Some(value.trim().parse().map_err(|_| {
                    RelayError::invalid_request(format!("invalid n: {}", value))
                })?)
            }
            _ => {}
        }
    }
    Ok(parsed)
}

async fn relay_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(app_state, request_id, auth, uri, headers, body, None).await
}

/// Legacy engine route; the path names the model when the body does not.
async fn engine_embeddings_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    OriginalUri(uri): OriginalUri,
    Path(model): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(app_state, request_id, auth, uri, headers, body, Some(model)).await
}

async fn dispatch(
    app_state: Arc<AppState>,
    request_id: RequestId,
    auth: AuthContext,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    path_model: Option<String>,
) -> Response {
    let Some(mode) = RelayMode::from_path(uri.path()) else {
        return RelayError::not_implemented(format!("{} is not supported", uri.path()))
            .into_response_with(&request_id);
    };
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let parsed = if mode.is_multipart() && content_type.starts_with("multipart/form-data") {
        parse_multipart(&content_type, body.clone())
            .await
            .map(|request| (request, Some((content_type, body.clone()))))
    } else {
        serde_json::from_slice::<GeneralOpenAIRequest>(&body)
            .map(|request| (request, None))
            .map_err(|e| RelayError::invalid_request(format!("invalid request body: {}", e)))
    };
    let (mut request, multipart) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            app_state.metrics.record_error(err.kind.as_str());
            return err.into_response_with(&request_id);
        }
    };
    if request.model.is_empty() {
        request.model = path_model.unwrap_or_else(|| default_model(mode).to_string());
    }
    debug!("[{}] {:?} request for {}", request_id, mode, request.model);

    relay(
        app_state,
        RelayInput {
            mode,
            request_id: request_id.to_string(),
            auth,
            request,
            multipart,
            raw_body: body,
        },
    )
    .await
}

#[derive(Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelObject>,
}

fn visible_models(app_state: &AppState, auth: &AuthContext) -> Result<Vec<ModelObject>, RelayError> {
    let mut seen = HashSet::new();
    let models = Ability::list_group_models(&auth.group)?
        .into_iter()
        .filter(|m| auth.allowed_models.is_empty() || auth.allowed_models.contains(&m.model))
        .filter(|m| seen.insert(m.model.clone()))
        .map(|m| ModelObject {
            owned_by: app_state
                .registry
                .get(m.channel_type)
                .map(|adaptor| adaptor.channel_name().to_string())
                .unwrap_or_else(|| "custom".to_string()),
            id: m.model,
            object: "model".to_string(),
            created: 1626777600,
        })
        .collect();
    Ok(models)
}

async fn list_models(
    State(app_state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
) -> Response {
    match visible_models(&app_state, &auth) {
        Ok(data) => Json(ModelList {
            object: "list",
            data,
        })
        .into_response(),
        Err(err) => {
            error!("[{}] failed to list models: {}", request_id, err);
            err.into_response_with(&request_id)
        }
    }
}

async fn retrieve_model(
    State(app_state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    Path(model): Path<String>,
) -> Response {
    let found = visible_models(&app_state, &auth).map(|models| {
        models.into_iter().find(|m| m.id == model)
    });
    match found {
        Ok(Some(model)) => Json(model).into_response(),
        Ok(None) => RelayError::model_not_found(&model, &auth.group).into_response_with(&request_id),
        Err(err) => err.into_response_with(&request_id),
    }
}

pub fn create_relay_router(app_state: Arc<AppState>) -> StateRouter {
    let upload = || {
        post(relay_handler).layer(middleware::from_fn_with_state(
            app_state.clone(),
            upload_rate_limit,
        ))
    };
    create_state_router().nest(
        "/v1",
        create_state_router()
            .route("/chat/completions", post(relay_handler))
            .route("/completions", post(relay_handler))
            .route("/embeddings", post(relay_handler))
            .route("/engines/{model}/embeddings", post(engine_embeddings_handler))
            .route("/moderations", post(relay_handler))
            .route("/images/generations", post(relay_handler))
            .route("/images/edits", upload())
            .route("/audio/speech", post(relay_handler))
            .route("/audio/transcriptions", upload())
            .route("/audio/translations", upload())
            .route("/models", get(list_models))
            .route("/models/{model}", get(retrieve_model))
            .layer(DefaultBodyLimit::max(MAX_RELAY_BODY))
            .layer(middleware::from_fn_with_state(
                app_state.clone(),
                token_auth_middleware,
            ))
            .layer(middleware::from_fn_with_state(app_state, global_relay_rate_limit))
            .layer(CorsLayer::permissive()),
    )
}
