/// Durability of scheduled events across process restarts
mod common;

use async_trait::async_trait;
use aurora_id::{
    clock,
    config::PolicyConfig,
    scheduler::{EventHandler, EventKind, EventPayload, ScheduledEvent},
    AppContext, IdpResult,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records the session ids it is handed, in delivery order
#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: &ScheduledEvent) -> IdpResult<()> {
        if let EventPayload::DeleteSession { session_id } = &event.payload {
            self.0.lock().unwrap().push(session_id.clone());
        }
        Ok(())
    }
}

async fn stop(ctx: AppContext) {
    ctx.shutdown();
    ctx.db.close().await;
}

#[tokio::test]
async fn test_due_events_delivered_once_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(&dir.path().join("idp.sqlite"), &[]);

    let ctx = AppContext::new(config.clone()).await.unwrap();
    let now = clock::now_ms();
    for (id, offset) in [("s3", -1_000), ("s1", -3_000), ("s2", -2_000)] {
        ctx.scheduler
            .schedule(
                EventPayload::DeleteSession {
                    session_id: id.to_string(),
                },
                now + offset,
            )
            .await
            .unwrap();
    }
    let future_at = now + 60_000;
    ctx.scheduler
        .schedule(
            EventPayload::DeleteSession {
                session_id: "later".to_string(),
            },
            future_at,
        )
        .await
        .unwrap();
    // Never started: nothing fired
    stop(ctx).await;

    let ctx = AppContext::new(config.clone()).await.unwrap();
    let recorder = Arc::new(Recorder::default());
    ctx.scheduler
        .register(EventKind::DeleteSession, recorder.clone());
    ctx.start().await.unwrap();

    assert_eq!(*recorder.0.lock().unwrap(), vec!["s1", "s2", "s3"]);
    let pending = ctx
        .scheduler
        .list_by_kind(EventKind::DeleteSession)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].fire_at, future_at);
    assert!(ctx.scheduler.is_armed());
    assert_eq!(ctx.scheduler.armed_target(), Some(future_at));
    stop(ctx).await;

    let ctx = AppContext::new(config).await.unwrap();
    let recorder = Arc::new(Recorder::default());
    ctx.scheduler
        .register(EventKind::DeleteSession, recorder.clone());
    ctx.start().await.unwrap();
    assert!(recorder.0.lock().unwrap().is_empty());
    stop(ctx).await;
}

#[tokio::test]
async fn test_session_that_expired_while_down_is_removed_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(&dir.path().join("idp.sqlite"), &[]);
    config.policy = PolicyConfig {
        session_ttl: Duration::from_secs(2),
        session_renewal_window: Duration::from_secs(1),
        ..PolicyConfig::default()
    };

    let ctx = AppContext::new(config.clone()).await.unwrap();
    let (_, issued) = ctx
        .accounts
        .register_with_password("alice", None, "password123")
        .await
        .unwrap();
    let session_id = issued.session.id.clone();
    stop(ctx).await;

    tokio::time::sleep(Duration::from_millis(2_300)).await;

    let ctx = AppContext::new(config).await.unwrap();
    assert!(ctx.sessions.get(&session_id).await.unwrap().is_some());

    ctx.start().await.unwrap();
    assert!(ctx.sessions.get(&session_id).await.unwrap().is_none());
    assert!(ctx
        .scheduler
        .list_by_kind(EventKind::DeleteSession)
        .await
        .unwrap()
        .is_empty());
    assert!(!ctx.scheduler.is_armed());

    // The account outlives its session
    assert!(ctx.accounts.get_by_username("alice").await.unwrap().is_some());
    stop(ctx).await;
}

#[tokio::test]
async fn test_refresh_token_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(&dir.path().join("idp.sqlite"), &[]);

    let ctx = AppContext::new(config.clone()).await.unwrap();
    ctx.start().await.unwrap();
    let (account, _) = ctx
        .accounts
        .register_with_password("alice", None, "password123")
        .await
        .unwrap();
    let (app, secret) = ctx
        .oauth
        .applications()
        .create("demo", None)
        .await
        .unwrap();
    ctx.oauth
        .applications()
        .update(
            &app.id,
            aurora_id::oauth::ApplicationUpdate {
                redirect_uris: Some(vec!["http://localhost/cb".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let sig = ctx.oauth.sign_params("http://localhost/cb", "1", &app.id).unwrap();
    let grant = ctx
        .oauth
        .authorize(
            &account.id,
            aurora_id::oauth::AuthorizeRequest {
                client_id: app.id.clone(),
                redirect_uri: "http://localhost/cb".to_string(),
                scope: "1".to_string(),
                state: None,
                sig,
            },
        )
        .await
        .unwrap();
    let tokens = ctx
        .oauth
        .exchange_code(&app.id, &secret, &grant.code, "http://localhost/cb")
        .await
        .unwrap();
    stop(ctx).await;

    let ctx = AppContext::new(config).await.unwrap();
    ctx.start().await.unwrap();
    let rotated = ctx
        .oauth
        .rotate_refresh_token(&app.id, &secret, &tokens.refresh_token)
        .await
        .unwrap();
    assert_ne!(rotated.refresh_token, tokens.refresh_token);
    assert_eq!(
        ctx.scheduler
            .list_by_kind(EventKind::DeleteRefreshToken)
            .await
            .unwrap()
            .len(),
        1
    );
    stop(ctx).await;
}
