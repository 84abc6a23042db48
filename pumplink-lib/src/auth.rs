//! Pump pairing.
//!
//! `JpakeAuthenticator` is a sans-IO state machine for the EC-JPAKE
//! handshake used by current firmware:
//!
//! 1. Rounds 1a and 1b exchange the two halves of each side's JPAKE round 1
//! 2. Round 2 exchanges the JPAKE round 2 payloads; the shared secret is derived
//! 3. Round 3 swaps nonces; the session key is HKDF(peer nonce, secret)
//! 4. Round 4 proves possession of the session key with HMAC-SHA256 over a fresh nonce
//!
//! `authenticate` drives it over a `PumpSession`. `LegacyPairing` covers the
//! older HMAC-SHA1 challenge/response with a 16-character code.

use crate::constants::{JPAKE_CLIENT_ROUND2_SIZE, JPAKE_ROUND1_HALF_SIZE, JPAKE_SERVER_ROUND2_SIZE, NONCE_SIZE};
use crate::crypto::jpake::{JpakeEngine, Role};
use crate::crypto::{SESSION_KEY_SIZE, derive_key, hmac_sha1, hmac_sha256, random_nonce, verify_hmac_sha256};
use crate::device::PumpSession;
use crate::error::PumpError;
use crate::message::{Envelope, MessageKind};
use crate::transport::ChunkTransport;
use bytes::{BufMut, Bytes, BytesMut};
use strum_macros::Display;
use tracing::{error, info};

const APP_ID_SIZE: usize = 2;
const HMAC_SHA256_SIZE: usize = 32;
const ROUND3_CHALLENGE_PARAM: u16 = 0;

/// Size of round-3 response cargo: app id, nonce, reserved
const ROUND3_RESPONSE_SIZE: usize = APP_ID_SIZE + NONCE_SIZE + 8;
/// Size of round-4 cargo: app id, nonce, reserved, HMAC-SHA256
const ROUND4_SIZE: usize = APP_ID_SIZE + NONCE_SIZE + 8 + HMAC_SHA256_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AuthState {
    Idle,
    Round1aSent,
    Round1aReceived,
    Round1bSent,
    Round1bReceived,
    Round2Sent,
    Round2Received,
    Confirm3Sent,
    Confirm3Received,
    Confirm4Sent,
    Complete,
    Failed,
}

/// Client side of the JPAKE pairing handshake.
pub struct JpakeAuthenticator {
    state: AuthState,
    app_id: u16,
    pairing_code: String,
    engine: Option<JpakeEngine>,
    local_round1: Option<Bytes>,
    peer_round1a: Option<Bytes>,
    shared_secret: Option<[u8; 32]>,
    session_key: Option<[u8; SESSION_KEY_SIZE]>,
}

impl std::fmt::Debug for JpakeAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JpakeAuthenticator")
            .field("state", &self.state)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl JpakeAuthenticator {
    /// `pairing_code` is the short numeric code shown on the pump.
    pub fn new(app_id: u16, pairing_code: impl Into<String>) -> Self {
        Self {
            state: AuthState::Idle,
            app_id,
            pairing_code: pairing_code.into(),
            engine: None,
            local_round1: None,
            peer_round1a: None,
            shared_secret: None,
            session_key: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn app_id(&self) -> u16 {
        self.app_id
    }

    pub fn is_complete(&self) -> bool {
        self.state == AuthState::Complete
    }

    /// The confirmed session key, once the handshake is complete.
    pub fn session_key(&self) -> Option<&[u8; SESSION_KEY_SIZE]> {
        match self.state {
            AuthState::Complete => self.session_key.as_ref(),
            _ => None,
        }
    }

    /// Back to `Idle`, forgetting all key material.
    pub fn reset(&mut self) {
        self.clear_material();
        self.state = AuthState::Idle;
    }

    pub fn build_round1a(&mut self, tx_id: u8) -> Result<Vec<Bytes>, PumpError> {
        self.expect(AuthState::Idle)?;
        let engine = match JpakeEngine::new(Role::Client, self.pairing_code.as_bytes()) {
            Ok(engine) => engine,
            Err(e) => return Err(self.fail(e)),
        };
        let round1 = engine.round1();
        self.engine = Some(engine);
        self.local_round1 = Some(round1.clone());
        let chunks = self.build(MessageKind::Jpake1a, tx_id, &round1[..JPAKE_ROUND1_HALF_SIZE])?;
        self.state = AuthState::Round1aSent;
        Ok(chunks)
    }

    pub fn process_round1a(&mut self, cargo: &[u8]) -> Result<(), PumpError> {
        self.expect(AuthState::Round1aSent)?;
        let half = self.payload(cargo, JPAKE_ROUND1_HALF_SIZE)?;
        self.peer_round1a = Some(Bytes::copy_from_slice(half));
        self.state = AuthState::Round1aReceived;
        Ok(())
    }

    pub fn build_round1b(&mut self, tx_id: u8) -> Result<Vec<Bytes>, PumpError> {
        self.expect(AuthState::Round1aReceived)?;
        let Some(round1) = self.local_round1.clone() else {
            return Err(self.fail(PumpError::InvalidState(self.state)));
        };
        let chunks = self.build(MessageKind::Jpake1b, tx_id, &round1[JPAKE_ROUND1_HALF_SIZE..])?;
        self.state = AuthState::Round1bSent;
        Ok(chunks)
    }

    pub fn process_round1b(&mut self, cargo: &[u8]) -> Result<(), PumpError> {
        self.expect(AuthState::Round1bSent)?;
        let second = self.payload(cargo, JPAKE_ROUND1_HALF_SIZE)?.to_vec();
        let result = match (self.engine.as_mut(), self.peer_round1a.as_ref()) {
            (Some(engine), Some(first)) => engine.read_round1_halves(first, &second),
            _ => Err(PumpError::InvalidState(self.state)),
        };
        if let Err(e) = result {
            return Err(self.fail(e));
        }
        self.state = AuthState::Round1bReceived;
        Ok(())
    }

    pub fn build_round2(&mut self, tx_id: u8) -> Result<Vec<Bytes>, PumpError> {
        self.expect(AuthState::Round1bReceived)?;
        let round2 = match self.engine.as_ref().map(JpakeEngine::round2) {
            Some(Ok(round2)) => round2,
            Some(Err(e)) => return Err(self.fail(e)),
            None => return Err(self.fail(PumpError::InvalidState(self.state))),
        };
        debug_assert_eq!(round2.len(), JPAKE_CLIENT_ROUND2_SIZE);
        let chunks = self.build(MessageKind::Jpake2, tx_id, &round2)?;
        self.state = AuthState::Round2Sent;
        Ok(chunks)
    }

    /// Reads the pump's round 2 and derives the shared secret.
    pub fn process_round2(&mut self, cargo: &[u8]) -> Result<(), PumpError> {
        self.expect(AuthState::Round2Sent)?;
        let round2 = self.payload(cargo, JPAKE_SERVER_ROUND2_SIZE)?.to_vec();
        let result = match self.engine.as_mut() {
            Some(engine) => engine.read_round2(&round2).and_then(|_| engine.derive_secret()),
            None => Err(PumpError::InvalidState(self.state)),
        };
        match result {
            Ok(secret) => {
                self.shared_secret = Some(secret);
                // the engine holds ephemeral scalars that are no longer needed
                self.engine = None;
                self.local_round1 = None;
                self.peer_round1a = None;
                self.state = AuthState::Round2Received;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Round 3 carries a challenge parameter and a local nonce.
    pub fn build_round3(&mut self, tx_id: u8) -> Result<Vec<Bytes>, PumpError> {
        self.expect(AuthState::Round2Received)?;
        let mut cargo = BytesMut::with_capacity(2 + NONCE_SIZE);
        cargo.put_u16_le(ROUND3_CHALLENGE_PARAM);
        cargo.extend_from_slice(&random_nonce());
        let chunks = self.envelope(MessageKind::Jpake3SessionKey, tx_id, cargo.freeze())?;
        self.state = AuthState::Confirm3Sent;
        Ok(chunks)
    }

    /// Takes the pump's nonce and derives the session key from it.
    pub fn process_round3(&mut self, cargo: &[u8]) -> Result<(), PumpError> {
        self.expect(AuthState::Confirm3Sent)?;
        self.check_len(cargo, ROUND3_RESPONSE_SIZE)?;
        let nonce = &cargo[APP_ID_SIZE..APP_ID_SIZE + NONCE_SIZE];
        let Some(secret) = self.shared_secret else {
            return Err(self.fail(PumpError::InvalidState(self.state)));
        };
        self.session_key = Some(derive_key(nonce, &secret));
        self.state = AuthState::Confirm3Received;
        Ok(())
    }

    pub fn build_round4(&mut self, tx_id: u8) -> Result<Vec<Bytes>, PumpError> {
        self.expect(AuthState::Confirm3Received)?;
        let Some(key) = self.session_key else {
            return Err(self.fail(PumpError::InvalidState(self.state)));
        };
        let nonce = random_nonce();
        let mut cargo = BytesMut::with_capacity(ROUND4_SIZE);
        cargo.put_u16_le(self.app_id);
        cargo.extend_from_slice(&nonce);
        cargo.put_bytes(0, 8);
        cargo.extend_from_slice(&hmac_sha256(&key, &nonce));
        let chunks = self.envelope(MessageKind::Jpake4KeyConfirmation, tx_id, cargo.freeze())?;
        self.state = AuthState::Confirm4Sent;
        Ok(chunks)
    }

    /// Verifies the pump's HMAC over its own nonce.
    pub fn process_round4(&mut self, cargo: &[u8]) -> Result<(), PumpError> {
        self.expect(AuthState::Confirm4Sent)?;
        self.check_len(cargo, ROUND4_SIZE)?;
        let nonce = &cargo[APP_ID_SIZE..APP_ID_SIZE + NONCE_SIZE];
        let tag_start = APP_ID_SIZE + NONCE_SIZE + 8;
        let tag = &cargo[tag_start..tag_start + HMAC_SHA256_SIZE];

        let verified = self
            .session_key
            .as_ref()
            .is_some_and(|key| verify_hmac_sha256(key, nonce, tag));
        if !verified {
            return Err(self.fail(PumpError::Authentication("pump key confirmation did not verify".into())));
        }
        self.shared_secret = None;
        self.state = AuthState::Complete;
        info!(app_id = self.app_id, "pump pairing complete");
        Ok(())
    }

    fn expect(&mut self, required: AuthState) -> Result<(), PumpError> {
        if self.state == required {
            Ok(())
        } else {
            let actual = self.state;
            Err(self.fail(PumpError::InvalidState(actual)))
        }
    }

    fn check_len(&mut self, cargo: &[u8], expected: usize) -> Result<(), PumpError> {
        if cargo.len() < expected {
            return Err(self.fail(PumpError::InsufficientData {
                expected,
                actual: cargo.len(),
            }));
        }
        Ok(())
    }

    /// The JPAKE bytes after the app id.
    fn payload<'a>(&mut self, cargo: &'a [u8], len: usize) -> Result<&'a [u8], PumpError> {
        self.check_len(cargo, APP_ID_SIZE + len)?;
        Ok(&cargo[APP_ID_SIZE..APP_ID_SIZE + len])
    }

    /// `app_id || jpake bytes` wrapped and fragmented.
    fn build(&mut self, kind: MessageKind, tx_id: u8, jpake: &[u8]) -> Result<Vec<Bytes>, PumpError> {
        let mut cargo = BytesMut::with_capacity(APP_ID_SIZE + jpake.len());
        cargo.put_u16_le(self.app_id);
        cargo.extend_from_slice(jpake);
        self.envelope(kind, tx_id, cargo.freeze())
    }

    fn envelope(&mut self, kind: MessageKind, tx_id: u8, cargo: Bytes) -> Result<Vec<Bytes>, PumpError> {
        match Envelope::request(kind, tx_id, cargo).and_then(|envelope| envelope.to_chunks()) {
            Ok(chunks) => Ok(chunks),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, err: PumpError) -> PumpError {
        if self.state != AuthState::Failed {
            error!(state = %self.state, error = %err, "pump pairing failed");
        }
        self.clear_material();
        self.state = AuthState::Failed;
        err
    }

    fn clear_material(&mut self) {
        self.engine = None;
        self.local_round1 = None;
        self.peer_round1a = None;
        self.shared_secret = None;
        self.session_key = None;
    }
}

/// Run the whole JPAKE handshake, one request in flight at a time.
pub async fn authenticate<T: ChunkTransport>(
    session: &mut PumpSession<T>,
    auth: &mut JpakeAuthenticator,
) -> Result<(), PumpError> {
    info!(app_id = auth.app_id(), "starting JPAKE pairing");

    let tx = session.next_transaction_id();
    let chunks = auth.build_round1a(tx)?;
    let cargo = exchange(session, auth, MessageKind::Jpake1a, tx, chunks).await?;
    auth.process_round1a(&cargo)?;

    let tx = session.next_transaction_id();
    let chunks = auth.build_round1b(tx)?;
    let cargo = exchange(session, auth, MessageKind::Jpake1b, tx, chunks).await?;
    auth.process_round1b(&cargo)?;

    let tx = session.next_transaction_id();
    let chunks = auth.build_round2(tx)?;
    let cargo = exchange(session, auth, MessageKind::Jpake2, tx, chunks).await?;
    auth.process_round2(&cargo)?;

    let tx = session.next_transaction_id();
    let chunks = auth.build_round3(tx)?;
    let cargo = exchange(session, auth, MessageKind::Jpake3SessionKey, tx, chunks).await?;
    auth.process_round3(&cargo)?;

    let tx = session.next_transaction_id();
    let chunks = auth.build_round4(tx)?;
    let cargo = exchange(session, auth, MessageKind::Jpake4KeyConfirmation, tx, chunks).await?;
    auth.process_round4(&cargo)
}

/// A transport failure mid-handshake also leaves the authenticator failed.
async fn exchange<T: ChunkTransport>(
    session: &mut PumpSession<T>,
    auth: &mut JpakeAuthenticator,
    kind: MessageKind,
    tx_id: u8,
    chunks: Vec<Bytes>,
) -> Result<Bytes, PumpError> {
    match session.transact(kind, tx_id, chunks).await {
        Ok(cargo) => Ok(cargo),
        Err(e) => Err(auth.fail(e)),
    }
}

pub const LEGACY_PAIRING_CODE_LEN: usize = 16;
const LEGACY_CHALLENGE_RESPONSE_SIZE: usize = APP_ID_SIZE + 20 + NONCE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LegacyState {
    Idle,
    ChallengeSent,
    ChallengeReceived,
    ResponseSent,
    Complete,
    Failed,
}

/// Challenge/response pairing used before JPAKE.
#[derive(Debug)]
pub struct LegacyPairing {
    state: LegacyState,
    app_id: u16,
    pairing_code: String,
    hmac_key: Option<[u8; NONCE_SIZE]>,
}

impl LegacyPairing {
    /// The code must be 16 alphanumeric characters; dashes and spaces a
    /// user may have typed are ignored.
    pub fn new(app_id: u16, pairing_code: &str) -> Result<Self, PumpError> {
        let code: String = pairing_code.chars().filter(|c| *c != '-' && !c.is_whitespace()).collect();
        if code.len() != LEGACY_PAIRING_CODE_LEN || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(PumpError::Authentication(format!(
                "legacy pairing code must be {LEGACY_PAIRING_CODE_LEN} alphanumeric characters"
            )));
        }
        Ok(Self {
            state: LegacyState::Idle,
            app_id,
            pairing_code: code,
            hmac_key: None,
        })
    }

    pub fn state(&self) -> LegacyState {
        self.state
    }

    pub fn reset(&mut self) {
        self.hmac_key = None;
        self.state = LegacyState::Idle;
    }

    pub fn build_central_challenge(&mut self, tx_id: u8) -> Result<Vec<Bytes>, PumpError> {
        self.expect(LegacyState::Idle)?;
        let mut cargo = BytesMut::with_capacity(APP_ID_SIZE + NONCE_SIZE);
        cargo.put_u16_le(self.app_id);
        cargo.extend_from_slice(&random_nonce());
        let chunks = self.envelope(MessageKind::CentralChallenge, tx_id, cargo.freeze())?;
        self.state = LegacyState::ChallengeSent;
        Ok(chunks)
    }

    /// `app_id || hash[20] || hmac_key[8]`; keeps the HMAC key.
    pub fn process_central_challenge(&mut self, cargo: &[u8]) -> Result<(), PumpError> {
        self.expect(LegacyState::ChallengeSent)?;
        if cargo.len() < LEGACY_CHALLENGE_RESPONSE_SIZE {
            return Err(self.fail(PumpError::InsufficientData {
                expected: LEGACY_CHALLENGE_RESPONSE_SIZE,
                actual: cargo.len(),
            }));
        }
        let key_start = APP_ID_SIZE + 20;
        let key: [u8; NONCE_SIZE] = cargo[key_start..key_start + NONCE_SIZE].try_into()?;
        self.hmac_key = Some(key);
        self.state = LegacyState::ChallengeReceived;
        Ok(())
    }

    pub fn build_pump_challenge(&mut self, tx_id: u8) -> Result<Vec<Bytes>, PumpError> {
        self.expect(LegacyState::ChallengeReceived)?;
        let Some(key) = self.hmac_key else {
            return Err(self.fail(PumpError::InvalidConfig("missing pump HMAC key".into())));
        };
        let mut cargo = BytesMut::with_capacity(APP_ID_SIZE + 20);
        cargo.put_u16_le(self.app_id);
        cargo.extend_from_slice(&hmac_sha1(self.pairing_code.as_bytes(), &key));
        let chunks = self.envelope(MessageKind::PumpChallenge, tx_id, cargo.freeze())?;
        self.state = LegacyState::ResponseSent;
        Ok(chunks)
    }

    /// `app_id || success u8`.
    pub fn process_pump_challenge(&mut self, cargo: &[u8]) -> Result<(), PumpError> {
        self.expect(LegacyState::ResponseSent)?;
        match cargo.get(APP_ID_SIZE) {
            Some(1) => {
                self.hmac_key = None;
                self.state = LegacyState::Complete;
                info!(app_id = self.app_id, "legacy pairing complete");
                Ok(())
            }
            Some(_) => Err(self.fail(PumpError::Authentication("pump rejected pairing code".into()))),
            None => Err(self.fail(PumpError::InsufficientData {
                expected: APP_ID_SIZE + 1,
                actual: cargo.len(),
            })),
        }
    }

    fn expect(&mut self, required: LegacyState) -> Result<(), PumpError> {
        if self.state == required {
            return Ok(());
        }
        let message = format!("legacy pairing expected {required}, was {}", self.state);
        Err(self.fail(PumpError::Authentication(message)))
    }

    fn envelope(&mut self, kind: MessageKind, tx_id: u8, cargo: Bytes) -> Result<Vec<Bytes>, PumpError> {
        match Envelope::request(kind, tx_id, cargo).and_then(|envelope| envelope.to_chunks()) {
            Ok(chunks) => Ok(chunks),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, err: PumpError) -> PumpError {
        error!(state = %self.state, error = %err, "legacy pairing failed");
        self.hmac_key = None;
        self.state = LegacyState::Failed;
        err
    }
}

/// Run the legacy challenge/response over a session.
pub async fn pair_legacy<T: ChunkTransport>(
    session: &mut PumpSession<T>,
    pairing: &mut LegacyPairing,
) -> Result<(), PumpError> {
    let tx = session.next_transaction_id();
    let chunks = pairing.build_central_challenge(tx)?;
    let cargo = match session.transact(MessageKind::CentralChallenge, tx, chunks).await {
        Ok(cargo) => cargo,
        Err(e) => return Err(pairing.fail(e)),
    };
    pairing.process_central_challenge(&cargo)?;

    let tx = session.next_transaction_id();
    let chunks = pairing.build_pump_challenge(tx)?;
    let cargo = match session.transact(MessageKind::PumpChallenge, tx, chunks).await {
        Ok(cargo) => cargo,
        Err(e) => return Err(pairing.fail(e)),
    };
    pairing.process_pump_challenge(&cargo)
}
