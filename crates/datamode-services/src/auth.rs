//! Challenge-response gate in front of everything except info and the
//! handshake itself.
//!
//! Unauthenticated -> NonceIssued (AUTH_INIT) -> Authenticated (AUTH_PROVE).
//! A nonce is good for exactly one verify attempt, pass or fail.

use datamode_core::crypto::{self, Nonce, SharedSecret};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    NonceIssued,
    Authenticated,
}

impl AuthState {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::NonceIssued => "nonce_issued",
            AuthState::Authenticated => "authenticated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("peer is not authenticated")]
    NotAuthenticated,
}

/// Where nonces come from. Production uses the OS-seeded RNG.
pub trait NonceSource: Send {
    fn next_nonce(&mut self) -> Nonce;
}

pub struct OsNonceSource;

impl NonceSource for OsNonceSource {
    fn next_nonce(&mut self) -> Nonce {
        crypto::generate_nonce()
    }
}

pub struct AuthGate {
    secret: SharedSecret,
    nonces: Box<dyn NonceSource>,
    state: AuthState,
    nonce: Option<Nonce>,
}

impl AuthGate {
    pub fn new(secret: SharedSecret) -> Self {
        Self::with_nonce_source(secret, Box::new(OsNonceSource))
    }

    pub fn with_nonce_source(secret: SharedSecret, nonces: Box<dyn NonceSource>) -> Self {
        Self {
            secret,
            nonces,
            state: AuthState::Unauthenticated,
            nonce: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    pub fn require(&self) -> Result<(), AuthError> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(AuthError::NotAuthenticated)
        }
    }

    /// Issue a fresh nonce. Starting a handshake drops any existing session.
    pub fn begin_handshake(&mut self) -> Nonce {
        let nonce = self.nonces.next_nonce();
        if self.state == AuthState::Authenticated {
            tracing::info!("re-handshake requested, dropping authenticated session");
        }
        self.nonce = Some(nonce);
        self.state = AuthState::NonceIssued;
        tracing::debug!(nonce = hex::encode(nonce), "nonce issued");
        nonce
    }

    /// Check a proof against the outstanding nonce. The nonce is consumed
    /// whatever the outcome; without one this always fails.
    pub fn verify(&mut self, token: &[u8], proof: &[u8]) -> bool {
        let Some(nonce) = self.nonce.take() else {
            tracing::warn!(state = self.state.as_str(), "proof without an outstanding nonce");
            self.state = AuthState::Unauthenticated;
            return false;
        };

        if crypto::verify_proof(&self.secret, token, &nonce, proof) {
            self.state = AuthState::Authenticated;
            tracing::info!(token = %String::from_utf8_lossy(token), "peer authenticated");
            true
        } else {
            self.state = AuthState::Unauthenticated;
            tracing::warn!(token = %String::from_utf8_lossy(token), "authentication failed");
            false
        }
    }

    /// Back to Unauthenticated (link loss, explicit logout).
    pub fn reset(&mut self) {
        if self.state != AuthState::Unauthenticated {
            tracing::info!("auth state reset");
        }
        self.state = AuthState::Unauthenticated;
        self.nonce = None;
    }
}

/// Deterministic nonces for tests: a little-endian counter.
#[cfg(test)]
pub(crate) struct CounterNonceSource(pub u64);

#[cfg(test)]
impl NonceSource for CounterNonceSource {
    fn next_nonce(&mut self) -> Nonce {
        self.0 += 1;
        let mut nonce = [0u8; crypto::NONCE_LEN];
        nonce[..8].copy_from_slice(&self.0.to_le_bytes());
        nonce
    }
}
