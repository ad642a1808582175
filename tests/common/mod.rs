//! Shared helpers for end-to-end tests
#![allow(dead_code)]

use aurora_id::{
    config::{
        AuthConfig, LoggingConfig, PolicyConfig, ProvidersConfig, RateLimitConfig, ServerConfig,
        ServiceConfig, StorageConfig,
    },
    db, server, AppContext,
};
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::Value;
use std::path::Path;
use tower::ServiceExt;

pub const PRIVATE_KEY: &str = include_str!("../fixtures/jwt_private.pem");
pub const PUBLIC_KEY: &str = include_str!("../fixtures/jwt_public.pem");

pub fn config(database: &Path, admins: &[&str]) -> ServerConfig {
    ServerConfig {
        service: ServiceConfig {
            hostname: "127.0.0.1".to_string(),
            port: 0,
            issuer: "https://id.test".to_string(),
            version: "test".to_string(),
        },
        storage: StorageConfig {
            data_directory: database
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir),
            database: database.to_path_buf(),
        },
        authentication: AuthConfig {
            jwt_private_key_pem: PRIVATE_KEY.to_string(),
            jwt_public_key_pem: PUBLIC_KEY.to_string(),
            totp_master_key: "7f".repeat(32),
            totp_issuer: "AuroraID".to_string(),
            oauth_sign_secret: "integration-sign-secret-0123456789".to_string(),
            admin_usernames: admins.iter().map(|s| s.to_string()).collect(),
        },
        policy: PolicyConfig::default(),
        providers: ProvidersConfig::default(),
        rate_limit: RateLimitConfig {
            enabled: false,
            ..Default::default()
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            json: false,
        },
    }
}

/// In-memory context with the scheduler running
pub async fn memory_context(admins: &[&str]) -> AppContext {
    let pool = db::create_memory_pool().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let ctx = AppContext::with_pool(config(Path::new(":memory:"), admins), pool).unwrap();
    ctx.start().await.unwrap();
    ctx
}

/// Router driven in-process
pub struct TestApp {
    pub ctx: AppContext,
    router: Router,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub session_token: Option<String>,
    pub body: Value,
}

impl TestApp {
    pub async fn new(admins: &[&str]) -> Self {
        let ctx = memory_context(admins).await;
        let router = server::build_router(ctx.clone());
        Self { ctx, router }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let authorization = token.map(|token| format!("Bearer {}", token));
        self.request_with_authorization(method, uri, authorization.as_deref(), body)
            .await
    }

    /// Send a request with a raw `Authorization` header value
    pub async fn request_with_authorization(
        &self,
        method: Method,
        uri: &str,
        authorization: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(authorization) = authorization {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let session_token = response
            .headers()
            .get("x-session-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        TestResponse {
            status,
            session_token,
            body,
        }
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> TestResponse {
        self.request(Method::POST, uri, token, Some(body)).await
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> TestResponse {
        self.request(Method::GET, uri, token, None).await
    }

    /// Register through the API and return the session token
    pub async fn register(&self, username: &str, password: &str) -> String {
        let res = self
            .post(
                "/api/accounts/create",
                None,
                serde_json::json!({ "username": username, "password": password }),
            )
            .await;
        assert_eq!(res.status, StatusCode::OK, "{}", res.body);
        res.body["token"].as_str().unwrap().to_string()
    }
}

/// Current code for a base32 secret as shown during setup
pub fn totp_code(secret_base32: &str) -> String {
    let secret = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, secret_base32)
        .expect("base32 secret");
    aurora_id::crypto::totp::code_at(&secret, aurora_id::crypto::totp::unix_now()).unwrap()
}
