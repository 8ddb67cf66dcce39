#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use eventqueue::config::{Config, QueueConfig};
use eventqueue::handlers::HandlerRegistry;
use eventqueue::state::SharedState;
use eventqueue::store::MemoryStore;

/// A running test server backed by an in-memory store.
pub struct TestApp {
    pub addr: SocketAddr,
    pub client: Client,
    pub state: SharedState,
    pub store: Arc<MemoryStore>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// POST an event, return (body, status).
    pub async fn enqueue(&self, body: &Value) -> (Value, StatusCode) {
        let resp = self
            .client
            .post(self.url("/api/v1/events"))
            .json(body)
            .send()
            .await
            .expect("enqueue request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    pub async fn get(&self, path: &str) -> (Value, StatusCode) {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("get request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        database_max_connections: 1,
        host: "127.0.0.1".parse().unwrap(),
        port: 0,
        log_level: "warn".to_string(),
        worker_count: 1,
        poll_interval: Duration::from_millis(10),
        processing_timeout: Duration::from_secs(300),
        queue: QueueConfig {
            batch_limit: 10,
            base_delay_ms: 1000,
            default_max_retries: 3,
        },
    }
}

/// Spawn a test app on a random port.
pub async fn spawn_app(handlers: HandlerRegistry) -> TestApp {
    let store = MemoryStore::arc();
    let (app, state) = eventqueue::build_app(store.clone(), test_config(), handlers);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });

    TestApp {
        addr,
        client: Client::new(),
        state,
        store,
    }
}

/// A throw-away database with migrations applied, or `None` when
/// `DATABASE_URL` is not set.
pub struct TestDb {
    pub pool: PgPool,
    pub db_name: String,
    admin_url: String,
}

pub async fn spawn_db() -> Option<TestDb> {
    let _ = dotenvy::dotenv();
    let base_url = std::env::var("DATABASE_URL").ok()?;

    let db_name = format!("eventqueue_test_{}", Uuid::now_v7().simple());

    let admin_url = base_url
        .rsplit_once('/')
        .map(|(base, _)| format!("{base}/postgres"))
        .unwrap_or_else(|| base_url.clone());

    let admin_pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&admin_url)
        .await
        .expect("Failed to connect to postgres for test DB creation");

    sqlx::query(&format!("CREATE DATABASE \"{db_name}\""))
        .execute(&admin_pool)
        .await
        .expect("Failed to create test database");

    admin_pool.close().await;

    let test_url = base_url
        .rsplit_once('/')
        .map(|(base, _)| format!("{base}/{db_name}"))
        .unwrap_or_else(|| base_url.clone());

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&test_url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations on test database");

    Some(TestDb {
        pool,
        db_name,
        admin_url,
    })
}

/// Drop the test database after a test completes.
pub async fn cleanup_db(db: TestDb) {
    db.pool.close().await;

    let admin_pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&db.admin_url)
        .await
        .expect("Failed to connect for cleanup");

    let _ = sqlx::query(&format!(
        "DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)",
        db.db_name
    ))
    .execute(&admin_pool)
    .await;

    admin_pool.close().await;
}
