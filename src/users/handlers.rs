use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::StoreError,
    state::AppState,
    users::{
        dto::{CreateUserRequest, LoginRequest, PublicUser, UpdateUserRequest},
        password::{hash_credential, verify_credential},
        repo_types::User,
    },
};

type Rejection = (StatusCode, String);

const MIN_PASSWORD_LEN: usize = 8;

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
}

pub fn login_routes() -> Router<AppState> {
    Router::new().route("/login", post(login))
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(raw: &str) -> Result<String, Rejection> {
    let email = raw.trim().to_lowercase();
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err((StatusCode::BAD_REQUEST, "Invalid email".into()));
    }
    Ok(email)
}

fn hash_new_password(plain: &str) -> Result<String, Rejection> {
    if plain.len() < MIN_PASSWORD_LEN {
        warn!("password too short");
        return Err((StatusCode::BAD_REQUEST, "Password too short".into()));
    }
    hash_credential(plain).map_err(|e| {
        error!(error = %e, "hash_credential failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".into())
    })
}

fn rejection(err: StoreError) -> Rejection {
    match err {
        StoreError::MissingIdentifier(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        StoreError::NotFound => (StatusCode::NOT_FOUND, "User not found".into()),
        StoreError::DuplicateIdentity => {
            (StatusCode::CONFLICT, "Email already registered".into())
        }
        StoreError::Transport { .. } => {
            error!(error = %err, "user store failure");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".into())
        }
    }
}

#[instrument(skip(state))]
pub async fn list_users(
    State(state): State<AppState>,
) -> Result<Json<Vec<PublicUser>>, Rejection> {
    let users = state.users.list().await.map_err(rejection)?;
    Ok(Json(users.into_iter().map(PublicUser::from).collect()))
}

#[instrument(skip(state, payload))]
pub async fn create_user(
    State(state): State<AppState>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<PublicUser>), Rejection> {
    let email = normalize_email(&payload.email)?;
    let credential = hash_new_password(&payload.password)?;

    let user = User {
        id: Uuid::new_v4().to_string(),
        email,
        name: payload.name.trim().to_string(),
        credential,
        last_login: None,
    };
    state.users.create(&user).await.map_err(rejection)?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((StatusCode::CREATED, Json(PublicUser::from(user))))
}

#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PublicUser>, Rejection> {
    let user = state.users.get_by_id(&id).await.map_err(rejection)?;
    Ok(Json(PublicUser::from(user)))
}

#[instrument(skip(state, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<Json<PublicUser>, Rejection> {
    let mut user = state.users.get_by_id(&id).await.map_err(rejection)?;

    if let Some(email) = payload.email.as_deref() {
        user.email = normalize_email(email)?;
    }
    if let Some(name) = payload.name.as_deref() {
        user.name = name.trim().to_string();
    }
    if let Some(password) = payload.password.as_deref() {
        user.credential = hash_new_password(password)?;
    }

    state.users.put(&user).await.map_err(rejection)?;

    info!(user_id = %user.id, "user updated");
    Ok(Json(PublicUser::from(user)))
}

#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, Rejection> {
    state.users.delete(&id).await.map_err(rejection)?;
    info!(user_id = %id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<Value>, Rejection> {
    let email = normalize_email(&payload.email)?;

    let mut user = match state.users.get_by_email(&email).await {
        Ok(user) => user,
        Err(StoreError::NotFound) => {
            warn!(email = %email, "login unknown email");
            return Err((StatusCode::NOT_FOUND, "User not found".into()));
        }
        Err(e) => return Err(rejection(e)),
    };

    let ok = verify_credential(&payload.password, &user.credential).map_err(|e| {
        error!(error = %e, user_id = %user.id, "verify_credential failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
    })?;
    if !ok {
        warn!(user_id = %user.id, "login invalid password");
        return Err((StatusCode::UNAUTHORIZED, "Incorrect password".into()));
    }

    user.last_login = Some(OffsetDateTime::now_utc());
    state.users.put(&user).await.map_err(rejection)?;

    info!(user_id = %user.id, "user logged in");
    Ok(Json(json!({ "status": "SUCCESS" })))
}
