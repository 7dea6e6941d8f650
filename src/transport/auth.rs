//! Authentication against the tunnel endpoint
//!
//! Tries the descriptor's password first (when one is present), then private
//! keys from `~/.ssh/id_*`, then ssh-agent identities. Problems gathering or
//! trying credentials are accumulated and attached to the terminal
//! authentication error instead of being silently dropped, so a failed login
//! explains everything that went wrong along the way.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use crate::addr::TunnelAddr;
use crate::error::DialError;

use super::russh::ClientHandler;

/// Authenticate `handle` for the descriptor's principal.
pub(crate) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    target: &TunnelAddr,
) -> Result<(), DialError> {
    let mut problems: Vec<DialError> = Vec::new();

    if let Some(password) = &target.password {
        match handle
            .authenticate_password(&target.username, password)
            .await
        {
            Ok(result) if result.success() => {
                info!(user = %target.username, "password authentication succeeded");
                return Ok(());
            }
            Ok(_) => problems.push(DialError::AuthenticationFailed(
                "password rejected by server".into(),
            )),
            Err(err) => problems.push(err.into()),
        }
    }

    for key in load_private_keys(&mut problems) {
        match handle.authenticate_publickey(&target.username, key).await {
            Ok(result) if result.success() => {
                info!(user = %target.username, "public key authentication succeeded");
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => problems.push(err.into()),
        }
    }

    match authenticate_with_agent(handle, &target.username).await {
        Ok(true) => return Ok(()),
        Ok(false) => {}
        Err(err) => problems.push(err),
    }

    let detail = if problems.is_empty() {
        "no credentials accepted by server".to_string()
    } else {
        DialError::many(problems).to_string()
    };
    Err(DialError::AuthenticationFailed(detail))
}

/// Collect signers from `~/.ssh/id_*` key files (skipping `.pub`).
/// Unreadable or unparseable files are recorded, not fatal.
fn load_private_keys(problems: &mut Vec<DialError>) -> Vec<PrivateKeyWithHashAlg> {
    let Some(home) = dirs::home_dir() else {
        problems.push(DialError::KeyError(
            "cannot determine home directory".into(),
        ));
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");

    let entries = match std::fs::read_dir(&ssh_dir) {
        Ok(entries) => entries,
        Err(err) => {
            problems.push(DialError::KeyError(format!(
                "cannot read {}: {}",
                ssh_dir.display(),
                err
            )));
            return Vec::new();
        }
    };

    let mut keys = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_private_key_file(&path) {
            continue;
        }
        match russh::keys::load_secret_key(&path, None) {
            Ok(key) => {
                debug!(path = %path.display(), "loaded private key");
                keys.push(PrivateKeyWithHashAlg::new(Arc::new(key), None));
            }
            Err(err) => {
                problems.push(DialError::KeyError(format!(
                    "cannot parse private key {}: {}",
                    path.display(),
                    err
                )));
            }
        }
    }
    keys
}

fn is_private_key_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.starts_with("id_") && !name.ends_with(".pub")
}

/// Send-safe wrapper around [`AgentClient`] implementing the [`Signer`]
/// trait. russh's built-in impl captures a borrow of a local key across an
/// await, which the compiler cannot prove `Send` through RPITIT; cloning the
/// key up front sidesteps that.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Try every identity held by the system ssh-agent.
///
/// Returns `Ok(false)` when no agent is configured or no key was accepted —
/// that only means "this method didn't work", not a hard failure.
async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    username: &str,
) -> Result<bool, DialError> {
    if std::env::var("SSH_AUTH_SOCK").is_err() {
        return Ok(false);
    }

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|err| DialError::Agent(format!("cannot connect to ssh-agent: {}", err)))?
        .dynamic();

    let keys = agent
        .request_identities()
        .await
        .map_err(|err| DialError::Agent(format!("cannot list agent keys: {}", err)))?;

    for key in &keys {
        debug!(key = %key.comment(), "trying agent key");
        match handle
            .authenticate_publickey_with(
                username,
                key.clone(),
                None,
                &mut AgentSigner { agent: &mut agent },
            )
            .await
        {
            Ok(result) if result.success() => {
                info!(user = %username, key = %key.comment(), "agent authentication succeeded");
                return Ok(true);
            }
            Ok(_) => {
                debug!(key = %key.comment(), "agent key rejected by server");
            }
            Err(err) => {
                warn!(key = %key.comment(), error = %err, "agent signing error");
            }
        }
    }
    Ok(false)
}
