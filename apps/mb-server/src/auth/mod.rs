mod password;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Validation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::future::Future;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::ids::uuid5_str;

pub use password::{hash_password, verify_password};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
}

/// Tokens are stateless so that worker processes can authenticate against the
/// main site with the token handed to them at dispatch time.
pub fn create_token(config: &Config, sub: &str) -> anyhow::Result<Token> {
    let claims = Claims {
        sub: sub.to_string(),
        exp: (Utc::now() + ChronoDuration::minutes(config.access_token_expire_minutes)).timestamp(),
    };
    let access_token = encode(
        &jsonwebtoken::Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.secret_key.as_bytes()),
    )?;
    Ok(Token {
        access_token,
        token_type: "bearer".to_string(),
    })
}

pub fn decode_token(config: &Config, token: &str) -> Option<String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret_key.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .ok()
    .map(|data| data.claims.sub)
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub can_upload: bool,
    pub can_delete: bool,
    pub disabled: bool,
}

pub async fn find_user(db: &PgPool, username: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, username, email, first_name, last_name, hashed_password,
               can_upload, can_delete, disabled
        FROM users
        WHERE username = $1
        LIMIT 1
        "#,
    )
    .bind(username)
    .fetch_optional(db)
    .await
}

pub async fn authenticate_user(
    db: &PgPool,
    username: &str,
    password: &str,
) -> Result<Option<User>, sqlx::Error> {
    let Some(user) = find_user(db, username).await? else {
        return Ok(None);
    };
    if verify_password(password, &user.hashed_password) {
        Ok(Some(user))
    } else {
        Ok(None)
    }
}

/// Upsert the bootstrap account from `MB_SUPERUSER_*`. Account ids are
/// UUIDv5 of the username, so this is stable across restarts.
pub async fn ensure_superuser(db: &PgPool, config: &Config) -> anyhow::Result<()> {
    let id = uuid5_str(&config.superuser_username);
    let hashed = hash_password(&config.superuser_password)?;
    sqlx::query(
        r#"
        INSERT INTO users (id, username, email, first_name, last_name, hashed_password,
                           can_upload, can_delete, disabled)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, TRUE, FALSE)
        ON CONFLICT (id) DO UPDATE SET
            email = EXCLUDED.email,
            hashed_password = EXCLUDED.hashed_password,
            can_upload = TRUE,
            can_delete = TRUE,
            disabled = FALSE
        "#,
    )
    .bind(id)
    .bind(&config.superuser_username)
    .bind(&config.superuser_email)
    .bind(&config.superuser_first_name)
    .bind(&config.superuser_last_name)
    .bind(hashed)
    .execute(db)
    .await?;
    Ok(())
}

/// Extractor for authenticated, active accounts.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl<S> FromRequestParts<S> for AuthUser
where
    Config: FromRef<S>,
    PgPool: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let config = Config::from_ref(state);
        let db = PgPool::from_ref(state);
        let token_result: Result<String, AppError> = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AppError::unauthorized("Could not validate credentials."));

        async move {
            let token = token_result?;
            let username = decode_token(&config, &token)
                .ok_or_else(|| AppError::unauthorized("Could not validate credentials."))?;
            let user = find_user(&db, &username)
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "database error");
                    AppError::internal("Internal server error")
                })?
                .ok_or_else(|| AppError::unauthorized("Could not validate credentials."))?;
            if user.disabled {
                return Err(AppError::bad_request("Inactive user."));
            }
            Ok(AuthUser(user))
        }
    }
}

pub fn require_upload(user: &User) -> AppResult<()> {
    if user.can_upload {
        Ok(())
    } else {
        Err(AppError::unauthorized(
            "User is not allowed to upload files.",
        ))
    }
}

pub fn require_delete(user: &User) -> AppResult<()> {
    if user.can_delete {
        Ok(())
    } else {
        Err(AppError::unauthorized(
            "User is not allowed to delete files.",
        ))
    }
}
