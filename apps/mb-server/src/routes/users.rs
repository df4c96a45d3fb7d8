use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;

use crate::auth::{self, AuthUser, Token};
use crate::error::map_db_error;
use crate::ids::uuid5_str;
use crate::routes::response::UserResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct TokenForm {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct UserForm {
    username: String,
    password: String,
    email: String,
    last_name: String,
    first_name: String,
}

/// At least 8 characters with upper case, lower case, digit and one of the
/// permitted special characters.
fn acceptable_password(password: &str) -> bool {
    const SPECIALS: &str = "@$!%*?&";
    password.len() >= 8
        && password.chars().any(|ch| ch.is_ascii_uppercase())
        && password.chars().any(|ch| ch.is_ascii_lowercase())
        && password.chars().any(|ch| ch.is_ascii_digit())
        && password
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || SPECIALS.contains(ch))
}

#[utoipa::path(
    post,
    path = "/user/token",
    tag = "account",
    responses(
        (status = 200, description = "Bearer token", body = Token),
        (status = 401, description = "Incorrect username or password")
    )
)]
pub(crate) async fn acquire_token(
    State(state): State<AppState>,
    Form(form): Form<TokenForm>,
) -> Result<Json<Token>, (StatusCode, String)> {
    let user = auth::authenticate_user(&state.db, &form.username, &form.password)
        .await
        .map_err(map_db_error)?
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "Incorrect username or password.".to_string(),
        ))?;
    if user.disabled {
        return Err((StatusCode::BAD_REQUEST, "Inactive user.".to_string()));
    }

    let token = auth::create_token(&state.config, &user.username).map_err(|err| {
        tracing::error!(error = format!("{err:#}"), "token issuance failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    })?;
    Ok(Json(token))
}

async fn ensure_user_available(db: &PgPool, form: &UserForm) -> Result<(), (StatusCode, String)> {
    let taken: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = $1)")
            .bind(&form.username)
            .fetch_one(db)
            .await
            .map_err(map_db_error)?;
    if taken {
        return Err((
            StatusCode::CONFLICT,
            "Username already exists.".to_string(),
        ));
    }

    let taken: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
        .bind(&form.email)
        .fetch_one(db)
        .await
        .map_err(map_db_error)?;
    if taken {
        return Err((StatusCode::CONFLICT, "Email already exists.".to_string()));
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/user/check",
    tag = "account",
    request_body = UserForm,
    responses(
        (status = 200, description = "Username and email are free"),
        (status = 409, description = "Already taken")
    )
)]
pub(crate) async fn check_new_user(
    State(state): State<AppState>,
    Json(form): Json<UserForm>,
) -> Result<Json<JsonValue>, (StatusCode, String)> {
    ensure_user_available(&state.db, &form).await?;
    Ok(Json(json!({ "message": "User does not exist." })))
}

#[utoipa::path(
    post,
    path = "/user/new",
    tag = "account",
    request_body = UserForm,
    responses(
        (status = 200, description = "User created"),
        (status = 400, description = "Password too weak"),
        (status = 409, description = "Already taken")
    )
)]
pub(crate) async fn create_new_user(
    State(state): State<AppState>,
    Json(form): Json<UserForm>,
) -> Result<Json<JsonValue>, (StatusCode, String)> {
    if !acceptable_password(&form.password) {
        return Err((
            StatusCode::BAD_REQUEST,
            "At least 8 characters, with at least one uppercase letter, one lowercase letter, \
             and one number."
                .to_string(),
        ));
    }
    ensure_user_available(&state.db, &form).await?;

    let hashed = auth::hash_password(&form.password).map_err(|err| {
        tracing::error!(error = format!("{err:#}"), "password hashing failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    })?;

    sqlx::query(
        r#"
        INSERT INTO users (id, username, email, first_name, last_name, hashed_password,
                           can_upload, can_delete, disabled)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, TRUE, FALSE)
        "#,
    )
    .bind(uuid5_str(&form.username))
    .bind(&form.username)
    .bind(&form.email)
    .bind(&form.first_name)
    .bind(&form.last_name)
    .bind(hashed)
    .execute(&state.db)
    .await
    .map_err(map_db_error)?;

    Ok(Json(json!({ "message": "User created." })))
}

#[utoipa::path(
    delete,
    path = "/user/{user_id}",
    tag = "account",
    params(("user_id" = String, Path, description = "Account id")),
    responses(
        (status = 200, description = "User deleted"),
        (status = 401, description = "Unauthorized")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn delete_user(
    State(state): State<AppState>,
    AuthUser(_user): AuthUser,
    Path(user_id): Path<String>,
) -> Result<Json<JsonValue>, (StatusCode, String)> {
    if let Ok(target) = uuid::Uuid::parse_str(user_id.trim()) {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(target)
            .execute(&state.db)
            .await
            .map_err(map_db_error)?;
    }
    Ok(Json(json!({ "message": "User deleted." })))
}

#[utoipa::path(
    get,
    path = "/user/whoami",
    tag = "account",
    responses((status = 200, description = "Current account", body = UserResponse)),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn retrieve_myself(AuthUser(user): AuthUser) -> Json<UserResponse> {
    Json(UserResponse {
        id: user.id,
        username: user.username,
        email: user.email,
        last_name: user.last_name,
        first_name: user.first_name,
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/user/token", post(acquire_token))
        .route("/user/check", post(check_new_user))
        .route("/user/new", post(create_new_user))
        .route("/user/{user_id}", delete(delete_user))
        .route("/user/whoami", get(retrieve_myself))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_policy() {
        assert!(acceptable_password("Str0ng!pass"));
        assert!(!acceptable_password("short1A"));
        assert!(!acceptable_password("alllowercase1!"));
        assert!(!acceptable_password("ALLUPPERCASE1!"));
        assert!(!acceptable_password("NoDigits!!"));
        assert!(!acceptable_password("Has spaces 1A"));
    }
}
