use std::sync::Arc;

use crate::auth::User;
use crate::config::Config;
use crate::db;
use crate::ids::uuid5_str;
use crate::jobs::JobDispatcher;
use crate::search::ElasticService;
use crate::state::AppState;

pub fn test_config() -> Config {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let fs_root = tempdir.keep();

    Config {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        fs_root,
        main_site: "http://localhost:8000".to_string(),
        port: 8000,
        secret_key: "test-secret-key-not-for-production".to_string(),
        algorithm: "HS256".to_string(),
        access_token_expire_minutes: 30,
        superuser_username: "admin".to_string(),
        superuser_email: "admin@localhost".to_string(),
        superuser_first_name: "Super".to_string(),
        superuser_last_name: "User".to_string(),
        superuser_password: "admin-password".to_string(),
        elastic_url: "http://localhost:9200".to_string(),
        worker_poll_interval_ms: 250,
        worker_heartbeat_seconds: 30,
    }
}

pub fn test_state() -> AppState {
    let config = test_config();
    let pool = db::connect_lazy(&config.database_url).expect("connect_lazy");
    let http = reqwest::Client::new();
    let elastic = Arc::new(ElasticService::new(config.elastic_url.clone(), http.clone()));
    let jobs = Arc::new(JobDispatcher::new(
        pool.clone(),
        config.clone(),
        elastic.clone(),
        http.clone(),
    ));

    AppState {
        config,
        db: pool,
        elastic,
        jobs,
        http,
    }
}

pub fn test_user(can_upload: bool, can_delete: bool) -> User {
    User {
        id: uuid5_str("test-user"),
        username: "test-user".to_string(),
        email: "test-user@example.com".to_string(),
        first_name: "Test".to_string(),
        last_name: "User".to_string(),
        hashed_password: String::new(),
        can_upload,
        can_delete,
        disabled: false,
    }
}
