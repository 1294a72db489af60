//! Per-connection pairing sessions and the setup/verify handlers.
//!
//! The exchange is permissive: key material is freshly generated and the
//! responder proof and verification token satisfy the wire format without
//! checking the peer's password verifier. Nothing downstream is gated on
//! the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ed25519_dalek::Signer;
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::identity::DeviceIdentity;
use crate::pairing::phase::{Marker, Outcome, SetupPhase, VerifyPhase};
use crate::session::ConnectionId;
use crate::tlv::{Tlv8, TlvType};

/// `Error` TLV value for a phase mismatch.
pub const ERROR_UNKNOWN: u8 = 1;

/// Default lifetime of an untouched pairing session.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ── PairingSession ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct PairingSession {
    setup: SetupPhase,
    verify: VerifyPhase,
    touched: Option<Instant>,
}

impl PairingSession {
    fn is_idle(&self) -> bool {
        !matches!(self.setup, SetupPhase::Started { .. })
            && !matches!(self.verify, VerifyPhase::Started { .. })
    }
}

// ── PairingRegistry ──────────────────────────────────────────────

/// Pairing sessions keyed by connection, with idle expiry.
pub struct PairingRegistry {
    identity: Arc<DeviceIdentity>,
    sessions: Mutex<HashMap<ConnectionId, PairingSession>>,
    idle_timeout: Duration,
}

impl PairingRegistry {
    pub fn new(identity: Arc<DeviceIdentity>) -> Self {
        Self::with_idle_timeout(identity, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(identity: Arc<DeviceIdentity>, idle_timeout: Duration) -> Self {
        Self {
            identity,
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.sessions.lock().contains_key(&conn)
    }

    /// Drop the session for a closed connection.
    pub fn remove(&self, conn: ConnectionId) {
        if self.sessions.lock().remove(&conn).is_some() {
            debug!(%conn, "pairing session discarded");
        }
    }

    /// Handle a `POST /pair-setup` body and return the TLV reply.
    pub fn handle_setup(&self, conn: ConnectionId, body: &[u8]) -> Vec<u8> {
        let request = Tlv8::parse(body);
        let marker = request.get_byte(TlvType::State).map(Marker::try_from);

        let mut sessions = self.sessions.lock();
        self.prune(&mut sessions);

        match marker {
            Some(Ok(Marker::Start)) => {
                let session = sessions.entry(conn).or_default();
                let (_secret, public_key) = ephemeral_pair();
                let mut salt = [0u8; 16];
                OsRng.fill_bytes(&mut salt);

                if session.setup.start(public_key, salt).is_err() {
                    warn!(%conn, "pair-setup start while setup in progress");
                    return error_reply();
                }
                session.touched = Some(Instant::now());
                debug!(%conn, "pair-setup M1 -> M2");

                Tlv8::new()
                    .with_byte(TlvType::State, Marker::StartResponse as u8)
                    .with(TlvType::PublicKey, &public_key)
                    .with(TlvType::Salt, &salt)
                    .to_bytes()
            }
            Some(Ok(Marker::Finish)) => {
                let Some(session) = sessions.get_mut(&conn) else {
                    warn!(%conn, "pair-setup finish without a session");
                    return error_reply();
                };
                let peer_key = request.get(TlvType::PublicKey).unwrap_or_default();
                let peer_proof = request.get(TlvType::Proof).unwrap_or_default();
                if peer_key.is_empty() || peer_proof.is_empty() {
                    warn!(%conn, "pair-setup M3 missing public key or proof; continuing");
                }

                let Ok((public_key, salt)) = session.setup.finish(Outcome::Success) else {
                    warn!(%conn, phase = %session.setup, "pair-setup finish out of phase");
                    return error_reply();
                };
                let proof = responder_proof(&salt, &public_key, peer_key, peer_proof);
                if session.is_idle() {
                    sessions.remove(&conn);
                }
                info!(%conn, "pair-setup complete");

                Tlv8::new()
                    .with_byte(TlvType::State, Marker::FinishResponse as u8)
                    .with(TlvType::Proof, &proof)
                    .to_bytes()
            }
            other => {
                warn!(%conn, marker = ?other, "unexpected pair-setup state");
                error_reply()
            }
        }
    }

    /// Handle a `POST /pair-verify` body and return the TLV reply.
    pub fn handle_verify(&self, conn: ConnectionId, body: &[u8]) -> Vec<u8> {
        let request = Tlv8::parse(body);
        let marker = request.get_byte(TlvType::State).map(Marker::try_from);

        let mut sessions = self.sessions.lock();
        self.prune(&mut sessions);

        match marker {
            Some(Ok(Marker::Start)) => {
                let session = sessions.entry(conn).or_default();
                let (_secret, public_key) = ephemeral_pair();
                let peer_key = request.get(TlvType::PublicKey).unwrap_or_default().to_vec();
                session.verify.start(public_key, peer_key);
                session.touched = Some(Instant::now());
                debug!(%conn, "pair-verify M1 -> M2");

                Tlv8::new()
                    .with_byte(TlvType::State, Marker::StartResponse as u8)
                    .with(TlvType::PublicKey, &public_key)
                    .to_bytes()
            }
            Some(Ok(Marker::Finish)) => {
                let Some(session) = sessions.get_mut(&conn) else {
                    warn!(%conn, "pair-verify finish without a session");
                    return error_reply();
                };
                let Ok((public_key, peer_key)) = session.verify.finish(Outcome::Success) else {
                    warn!(%conn, phase = %session.verify, "pair-verify finish out of phase");
                    return error_reply();
                };
                if session.is_idle() {
                    sessions.remove(&conn);
                }
                drop(sessions);

                let token = match self.verification_token(&public_key, &peer_key) {
                    Ok(token) => token,
                    Err(e) => {
                        warn!(%conn, "cannot build verification token: {e}");
                        return error_reply();
                    }
                };
                info!(%conn, "pair-verify complete");

                Tlv8::new()
                    .with_byte(TlvType::State, Marker::FinishResponse as u8)
                    .with(TlvType::EncryptedData, &token)
                    .to_bytes()
            }
            other => {
                warn!(%conn, marker = ?other, "unexpected pair-verify state");
                error_reply()
            }
        }
    }

    /// Identifier and signature over both ephemeral keys, TLV-wrapped.
    fn verification_token(
        &self,
        public_key: &[u8; 32],
        peer_key: &[u8],
    ) -> Result<Vec<u8>, crate::error::MiraError> {
        let signing_key = self.identity.signing_key()?;
        let mut message = Vec::with_capacity(32 + peer_key.len());
        message.extend_from_slice(public_key);
        message.extend_from_slice(peer_key);
        let signature = signing_key.sign(&message);

        Ok(Tlv8::new()
            .with(TlvType::Identifier, self.identity.device_id().as_bytes())
            .with(TlvType::Signature, &signature.to_bytes())
            .to_bytes())
    }

    fn prune(&self, sessions: &mut HashMap<ConnectionId, PairingSession>) {
        let timeout = self.idle_timeout;
        sessions.retain(|conn, s| {
            let live = s.touched.is_none_or(|t| t.elapsed() < timeout);
            if !live {
                debug!(%conn, "pairing session expired");
            }
            live
        });
    }
}

impl std::fmt::Debug for PairingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingRegistry")
            .field("sessions", &self.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn error_reply() -> Vec<u8> {
    Tlv8::new()
        .with_byte(TlvType::State, Marker::StartResponse as u8)
        .with_byte(TlvType::Error, ERROR_UNKNOWN)
        .to_bytes()
}

fn ephemeral_pair() -> (EphemeralSecret, [u8; 32]) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public.to_bytes())
}

/// 64-byte proof bound to this exchange's material.
fn responder_proof(salt: &[u8], public_key: &[u8], peer_key: &[u8], peer_proof: &[u8]) -> [u8; 64] {
    let mut hasher = blake3::Hasher::new_derive_key("mira pair-setup responder proof");
    hasher.update(salt);
    hasher.update(public_key);
    hasher.update(peer_key);
    hasher.update(peer_proof);
    let mut proof = [0u8; 64];
    hasher.finalize_xof().fill(&mut proof);
    proof
}

// ── Tests ────────────────────────────────────────────────────────
