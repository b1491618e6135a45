//! Login, logout, and key destruction.
//!
//! Login builds the per-user [`MessageCrypto`] context and publishes the
//! user's public key. Logout ends any active call and drops in-memory keys
//! but leaves the persisted key pair alone; only [`destroy_keys`] deletes it.

use std::sync::Arc;

use parley_crypto::Keychain;
use parley_protocol::events::{OutboundEvent, UserOnline};
use parley_protocol::{KeyDirectory, MessageCrypto, SignalTransport};

use crate::error::SessionError;
use crate::services::call_service::CallController;
use crate::state::{SharedState, UserSession};

/// Log `user` in and prepare their crypto context.
///
/// Key setup failures are logged, not fatal: the context retries lazily on
/// first use and calls fall back to clear signaling until it succeeds.
pub async fn login(
    state: &SharedState,
    user: UserSession,
    keychain: Arc<dyn Keychain>,
    directory: Arc<dyn KeyDirectory>,
    transport: &dyn SignalTransport,
) -> Result<Arc<MessageCrypto>, SessionError> {
    {
        let mut current = state.user.write();
        if let Some(existing) = current.as_ref() {
            return Err(SessionError::AlreadyLoggedIn(existing.user_id.clone()));
        }
        *current = Some(user.clone());
    }

    let crypto = Arc::new(MessageCrypto::new(
        user.user_id.clone(),
        keychain,
        directory,
    ));
    if let Err(e) = crypto.ensure_initialized().await {
        tracing::warn!(user = %user.user_id, error = %e, "encryption keys not ready");
    }
    *state.crypto.write() = Some(crypto.clone());

    let online = OutboundEvent::UserOnline(UserOnline {
        user_id: user.user_id.clone(),
    });
    if let Err(e) = transport.send(&online).await {
        tracing::warn!(user = %user.user_id, error = %e, "presence announcement failed");
    }

    tracing::info!(
        user = %user.user_id,
        encrypted = crypto.is_initialized(),
        "logged in"
    );
    Ok(crypto)
}

/// End any call and clear per-user state. Persisted keys survive.
pub async fn logout(state: &SharedState, calls: &CallController) -> Result<(), SessionError> {
    calls.end_active().await;
    let crypto = state.crypto.write().take();
    let user = state.user.write().take().ok_or(SessionError::NotLoggedIn)?;
    if let Some(crypto) = crypto {
        crypto.logout();
    }
    state.history.write().clear();
    tracing::info!(user = %user.user_id, "logged out");
    Ok(())
}

/// Log out and permanently delete the user's key pair.
///
/// Messages encrypted to the old key can no longer be read.
pub async fn destroy_keys(state: &SharedState, calls: &CallController) -> Result<(), SessionError> {
    let crypto = state.crypto.read().clone().ok_or(SessionError::NotLoggedIn)?;
    calls.end_active().await;
    crypto.destroy_keys()?;
    tracing::warn!(user = %crypto.owner_id(), "encryption keys destroyed");
    logout(state, calls).await
}
