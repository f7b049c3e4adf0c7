//! Common test utilities for E2E tests

use chrono::Utc;
use lagoon::data::{Actor, StoredObject};
use lagoon::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test application instance with a running HTTP server
pub struct TestApp {
    pub addr: String,
    pub state: AppState,
    pub client: reqwest::Client,
    pub _temp_dir: TempDir,
}

impl TestApp {
    /// Create a new test app backed by a temp database, with the router
    /// served on an OS-assigned port.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "test.example.com".to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path,
            },
            federation: config::FederationConfig::default(),
            timeline: config::TimelineConfig::default(),
            logging: config::LoggingConfig::default(),
        };

        let state = AppState::new(config).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let app = lagoon::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            client: reqwest::Client::new(),
            _temp_dir: temp_dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Register a local actor.
    pub async fn create_local_actor(&self, id: &str) -> Actor {
        let actor = Actor {
            id: id.to_string(),
            domain: "test.example.com".to_string(),
            is_local: true,
            name: Some(id.split('@').next().unwrap_or(id).to_string()),
            icon: None,
            inbox: None,
            outbox: None,
            url: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.state.db.upsert_actor(&actor).await.unwrap();
        actor
    }

    /// Store an object directly, bypassing dispatch (e.g. for remote
    /// authors).
    pub async fn store_object(&self, id: &str, actor_id: &str, to: &str) -> StoredObject {
        let object = StoredObject {
            id: id.to_string(),
            object_type: "Note".to_string(),
            actor_id: actor_id.to_string(),
            payload: r#"{"text":"hello"}"#.to_string(),
            summary: None,
            target: None,
            to_token: to.to_string(),
            can_reply: to.to_string(),
            can_react: to.to_string(),
            mentions: "[]".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        self.state.db.upsert_object(&object).await.unwrap();
        object
    }
}
