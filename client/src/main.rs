//! Headless demo: two users place an end-to-end encrypted call over the
//! in-process relay, talk for a few seconds, and hang up.
//!
//! Usage: `parley [config.json]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parley_lib::services::session_service;
use parley_crypto::{Keychain, MemoryKeychain};
use parley_lib::{
    logging, AppState, CallController, CallDeps, CallEvent, CallStatus, ClientConfig,
    SharedState, StrongholdKeychain, UserSession,
};
use parley_protocol::{LoopbackHub, MemoryBackend};
use parley_voice::loopback::{LoopbackMedia, LoopbackPeerFactory};
use tokio::sync::broadcast;

struct DemoUser {
    state: SharedState,
    calls: CallController,
    events: broadcast::Receiver<CallEvent>,
}

async fn connect(
    config: &ClientConfig,
    hub: &LoopbackHub,
    backend: &MemoryBackend,
    user: UserSession,
) -> anyhow::Result<DemoUser> {
    let state: SharedState = Arc::new(AppState::default());
    let transport = Arc::new(hub.connect(&user.user_id));
    let api = Arc::new(backend.session(&user.user_id));
    let keychain: Arc<dyn Keychain> = match &config.keystore_passphrase {
        Some(passphrase) => Arc::new(
            StrongholdKeychain::open(&config.keystore_dir, &user.user_id, passphrase)
                .context("unlocking keychain")?,
        ),
        None => {
            tracing::warn!(user = %user.user_id, "no keystore passphrase; keys will not persist");
            Arc::new(MemoryKeychain::new())
        }
    };

    session_service::login(&state, user, keychain, api.clone(), transport.as_ref()).await?;

    let calls = CallController::new(
        state.clone(),
        CallDeps {
            transport,
            history: api,
            media: Arc::new(LoopbackMedia::new()),
            peers: Arc::new(LoopbackPeerFactory::new()),
        },
        config.calls.clone(),
    );
    calls.spawn_listener();
    let events = calls.subscribe();
    Ok(DemoUser {
        state,
        calls,
        events,
    })
}

async fn wait_for_status(user: &mut DemoUser, status: CallStatus) -> anyhow::Result<()> {
    let wait = async {
        loop {
            match user.events.recv().await {
                Ok(CallEvent::StatusChanged { status: s, .. }) if s == status => return Ok(()),
                Ok(CallEvent::CallFailed { reason, .. }) => anyhow::bail!("call failed: {reason}"),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => anyhow::bail!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .with_context(|| format!("waiting for {status:?}"))?
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ClientConfig::load(config_path.as_deref()).context("loading config")?;
    logging::init(&config.log_filter);

    if config.api_token.is_some() {
        tracing::info!(url = %config.api_base_url, "API token set; the demo still runs against the in-process relay");
    }

    let backend = MemoryBackend::new();
    let hub = LoopbackHub::with_history(backend.clone());
    let mut alice = connect(&config, &hub, &backend, UserSession::new("alice", "Alice")).await?;
    let mut bob = connect(&config, &hub, &backend, UserSession::new("bob", "Bob")).await?;

    alice.calls.initiate("bob", "Bob", None).await?;
    wait_for_status(&mut bob, CallStatus::Ringing).await?;
    bob.calls.accept().await?;

    wait_for_status(&mut alice, CallStatus::Connected).await?;
    wait_for_status(&mut bob, CallStatus::Connected).await?;
    let encrypted = alice.calls.session().is_some_and(|s| s.is_encrypted);
    tracing::info!(encrypted, "call established");

    tokio::time::sleep(Duration::from_secs(3)).await;
    alice.calls.end().await?;
    wait_for_status(&mut bob, CallStatus::Ended).await?;

    for record in alice.calls.refresh_history().await? {
        tracing::info!(
            call_id = %record.id,
            status = ?record.status,
            duration = record.duration,
            "history"
        );
    }

    session_service::logout(&alice.state, &alice.calls).await?;
    session_service::logout(&bob.state, &bob.calls).await?;
    alice.calls.shutdown().await;
    bob.calls.shutdown().await;
    Ok(())
}
