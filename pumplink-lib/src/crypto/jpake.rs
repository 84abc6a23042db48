//! EC-JPAKE over secp256r1.
//!
//! Message encoding follows the TLS ECJPAKE layout the pump firmware uses:
//!
//! ```text
//! point  = len(1) || 0x04 || X(32) || Y(32)
//! zkp    = point(V) || len(1) || r(32)
//! round1 = point(X1) || zkp(x1) || point(X2) || zkp(x2)      (330 bytes)
//! round2 = [03 00 17]? || point(Xm) || zkp(xm)               (165 / 168 bytes)
//! ```
//!
//! The server prefixes its round-2 message with the ECParameters of the
//! named curve; the client does not.

use crate::constants::{JPAKE_CLIENT_ROUND2_SIZE, JPAKE_ROUND1_HALF_SIZE, JPAKE_ROUND1_SIZE};
use crate::error::PumpError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use p256::elliptic_curve::PrimeField;
use p256::elliptic_curve::ops::Reduce;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{AffinePoint, EncodedPoint, FieldBytes, NonZeroScalar, ProjectivePoint, Scalar, U256};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

const POINT_SIZE: usize = 65;
const SCALAR_SIZE: usize = 32;
/// ECParameters: curve_type = named_curve (3), NamedCurve = secp256r1 (23)
const EC_PARAMETERS: [u8; 3] = [0x03, 0x00, 0x17];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn id(self) -> &'static [u8] {
        match self {
            Role::Client => b"client",
            Role::Server => b"server",
        }
    }

    fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// One side of an EC-JPAKE exchange.
///
/// Ephemeral keys are generated on construction; `round1`, `read_round1`,
/// `round2`, `read_round2` and `derive_secret` must be called in that order
/// (the two round-1 calls may be swapped, as may the two round-2 calls).
pub struct JpakeEngine {
    role: Role,
    password: Scalar,
    xm1: Scalar,
    xm2: Scalar,
    big_xm1: ProjectivePoint,
    big_xm2: ProjectivePoint,
    peer_round1: Option<(ProjectivePoint, ProjectivePoint)>,
    peer_round2: Option<ProjectivePoint>,
}

impl std::fmt::Debug for JpakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JpakeEngine")
            .field("role", &self.role)
            .field("has_peer_round1", &self.peer_round1.is_some())
            .field("has_peer_round2", &self.peer_round2.is_some())
            .finish_non_exhaustive()
    }
}

impl JpakeEngine {
    pub fn new(role: Role, password: &[u8]) -> Result<Self, PumpError> {
        let password = password_scalar(password)?;
        let xm1 = *NonZeroScalar::random(&mut OsRng);
        let xm2 = *NonZeroScalar::random(&mut OsRng);
        Ok(Self {
            role,
            password,
            xm1,
            xm2,
            big_xm1: ProjectivePoint::GENERATOR * xm1,
            big_xm2: ProjectivePoint::GENERATOR * xm2,
            peer_round1: None,
            peer_round2: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Both ephemeral public keys with their proofs of knowledge.
    pub fn round1(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(JPAKE_ROUND1_SIZE);
        let g = ProjectivePoint::GENERATOR;
        write_point(&mut out, &self.big_xm1);
        write_zkp(&mut out, &g, &self.xm1, &self.big_xm1, self.role.id());
        write_point(&mut out, &self.big_xm2);
        write_zkp(&mut out, &g, &self.xm2, &self.big_xm2, self.role.id());
        out.freeze()
    }

    pub fn read_round1(&mut self, data: &[u8]) -> Result<(), PumpError> {
        if data.len() != JPAKE_ROUND1_SIZE {
            return Err(PumpError::Jpake(format!(
                "round 1 must be {JPAKE_ROUND1_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let g = ProjectivePoint::GENERATOR;
        let peer_id = self.role.peer().id();
        let mut buf = data;
        let xp1 = read_point(&mut buf)?;
        read_and_verify_zkp(&mut buf, &g, &xp1, peer_id)?;
        let xp2 = read_point(&mut buf)?;
        read_and_verify_zkp(&mut buf, &g, &xp2, peer_id)?;
        self.peer_round1 = Some((xp1, xp2));
        Ok(())
    }

    /// The wire protocol carries round 1 in two requests of 165 bytes each.
    pub fn read_round1_halves(&mut self, first: &[u8], second: &[u8]) -> Result<(), PumpError> {
        if first.len() != JPAKE_ROUND1_HALF_SIZE || second.len() != JPAKE_ROUND1_HALF_SIZE {
            return Err(PumpError::Jpake("round 1 halves must be 165 bytes each".into()));
        }
        let mut joined = Vec::with_capacity(JPAKE_ROUND1_SIZE);
        joined.extend_from_slice(first);
        joined.extend_from_slice(second);
        self.read_round1(&joined)
    }

    pub fn round2(&self) -> Result<Bytes, PumpError> {
        let (xp1, xp2) = self.peer_round1.ok_or_else(|| PumpError::Jpake("round 2 before peer round 1".into()))?;
        let generator = self.big_xm1 + xp1 + xp2;
        let xm = self.xm2 * self.password;
        let big_xm = generator * xm;

        let mut out = BytesMut::with_capacity(EC_PARAMETERS.len() + JPAKE_CLIENT_ROUND2_SIZE);
        if self.role == Role::Server {
            out.extend_from_slice(&EC_PARAMETERS);
        }
        write_point(&mut out, &big_xm);
        write_zkp(&mut out, &generator, &xm, &big_xm, self.role.id());
        Ok(out.freeze())
    }

    pub fn read_round2(&mut self, data: &[u8]) -> Result<(), PumpError> {
        let (xp1, _) = self.peer_round1.ok_or_else(|| PumpError::Jpake("peer round 2 before peer round 1".into()))?;
        let mut buf = data;
        if self.role == Role::Client {
            if buf.len() < EC_PARAMETERS.len() || buf[..EC_PARAMETERS.len()] != EC_PARAMETERS {
                return Err(PumpError::Jpake("round 2 missing secp256r1 parameters".into()));
            }
            buf.advance(EC_PARAMETERS.len());
        }
        let generator = xp1 + self.big_xm1 + self.big_xm2;
        let xp = read_point(&mut buf)?;
        read_and_verify_zkp(&mut buf, &generator, &xp, self.role.peer().id())?;
        if buf.has_remaining() {
            return Err(PumpError::Jpake(format!("{} trailing bytes after round 2", buf.remaining())));
        }
        self.peer_round2 = Some(xp);
        Ok(())
    }

    /// SHA-256 of the x coordinate of the shared point.
    pub fn derive_secret(&self) -> Result<[u8; 32], PumpError> {
        let (_, xp2) = self.peer_round1.ok_or_else(|| PumpError::Jpake("secret before peer round 1".into()))?;
        let xp = self.peer_round2.ok_or_else(|| PumpError::Jpake("secret before peer round 2".into()))?;
        let xm2s = self.xm2 * self.password;
        let shared = (xp - xp2 * xm2s) * self.xm2;
        if shared == ProjectivePoint::IDENTITY {
            return Err(PumpError::Jpake("shared point is the identity".into()));
        }
        let encoded = shared.to_affine().to_encoded_point(false);
        let x = encoded.x().ok_or_else(|| PumpError::Jpake("shared point has no x coordinate".into()))?;
        Ok(Sha256::digest(x).into())
    }
}

fn password_scalar(password: &[u8]) -> Result<Scalar, PumpError> {
    if password.is_empty() || password.len() > SCALAR_SIZE {
        return Err(PumpError::Jpake("password must be 1..=32 bytes".into()));
    }
    let mut padded = FieldBytes::default();
    padded[SCALAR_SIZE - password.len()..].copy_from_slice(password);
    let s = <Scalar as Reduce<U256>>::reduce_bytes(&padded);
    if s == Scalar::ZERO {
        return Err(PumpError::Jpake("password reduces to zero".into()));
    }
    Ok(s)
}

fn encode_point(point: &ProjectivePoint) -> EncodedPoint {
    point.to_affine().to_encoded_point(false)
}

fn write_point(out: &mut BytesMut, point: &ProjectivePoint) {
    let encoded = encode_point(point);
    out.put_u8(encoded.len() as u8);
    out.extend_from_slice(encoded.as_bytes());
}

fn read_point(buf: &mut &[u8]) -> Result<ProjectivePoint, PumpError> {
    if buf.remaining() < 1 + POINT_SIZE {
        return Err(PumpError::Jpake("truncated point".into()));
    }
    let len = buf.get_u8() as usize;
    if len != POINT_SIZE {
        return Err(PumpError::Jpake(format!("unsupported point length {len}")));
    }
    let encoded = EncodedPoint::from_bytes(&buf[..POINT_SIZE]).map_err(|e| PumpError::Jpake(format!("bad point: {e}")))?;
    buf.advance(POINT_SIZE);
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
    let point = ProjectivePoint::from(affine.ok_or_else(|| PumpError::Jpake("point not on curve".into()))?);
    if point == ProjectivePoint::IDENTITY {
        return Err(PumpError::Jpake("identity point".into()));
    }
    Ok(point)
}

fn zkp_hash(generator: &ProjectivePoint, v: &ProjectivePoint, x: &ProjectivePoint, id: &[u8]) -> Scalar {
    let mut hasher = Sha256::new();
    for point in [generator, v, x] {
        let encoded = encode_point(point);
        hasher.update((encoded.len() as u32).to_be_bytes());
        hasher.update(encoded.as_bytes());
    }
    hasher.update((id.len() as u32).to_be_bytes());
    hasher.update(id);
    <Scalar as Reduce<U256>>::reduce_bytes(&hasher.finalize())
}

/// Schnorr proof of knowledge of `x` where `big_x = generator * x`.
fn write_zkp(out: &mut BytesMut, generator: &ProjectivePoint, x: &Scalar, big_x: &ProjectivePoint, id: &[u8]) {
    let v = *NonZeroScalar::random(&mut OsRng);
    let big_v = *generator * v;
    let h = zkp_hash(generator, &big_v, big_x, id);
    let r = v - *x * h;
    write_point(out, &big_v);
    out.put_u8(SCALAR_SIZE as u8);
    out.extend_from_slice(&r.to_repr());
}

fn read_and_verify_zkp(
    buf: &mut &[u8],
    generator: &ProjectivePoint,
    big_x: &ProjectivePoint,
    id: &[u8],
) -> Result<(), PumpError> {
    let big_v = read_point(buf)?;
    if !buf.has_remaining() {
        return Err(PumpError::Jpake("truncated proof".into()));
    }
    let len = buf.get_u8() as usize;
    if len == 0 || len > SCALAR_SIZE || buf.remaining() < len {
        return Err(PumpError::Jpake(format!("bad proof scalar length {len}")));
    }
    let mut repr = FieldBytes::default();
    repr[SCALAR_SIZE - len..].copy_from_slice(&buf[..len]);
    buf.advance(len);
    let r: Option<Scalar> = Scalar::from_repr(repr).into();
    let r = r.ok_or_else(|| PumpError::Jpake("proof scalar out of range".into()))?;

    let h = zkp_hash(generator, &big_v, big_x, id);
    if *generator * r + *big_x * h != big_v {
        return Err(PumpError::Jpake("zero-knowledge proof rejected".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(client_code: &[u8], server_code: &[u8]) -> ([u8; 32], [u8; 32]) {
        let mut client = JpakeEngine::new(Role::Client, client_code).unwrap();
        let mut server = JpakeEngine::new(Role::Server, server_code).unwrap();

        let c1 = client.round1();
        let s1 = server.round1();
        server.read_round1(&c1).unwrap();
        client.read_round1_halves(&s1[..165], &s1[165..]).unwrap();

        let c2 = client.round2().unwrap();
        let s2 = server.round2().unwrap();
        server.read_round2(&c2).unwrap();
        client.read_round2(&s2).unwrap();

        (client.derive_secret().unwrap(), server.derive_secret().unwrap())
    }

    #[test]
    fn test_message_sizes() {
        let mut client = JpakeEngine::new(Role::Client, b"123456").unwrap();
        let mut server = JpakeEngine::new(Role::Server, b"123456").unwrap();
        let c1 = client.round1();
        let s1 = server.round1();
        assert_eq!(c1.len(), 330);
        assert_eq!(c1[0], 65);
        assert_eq!(c1[1], 0x04);
        client.read_round1(&s1).unwrap();
        server.read_round1(&c1).unwrap();
        assert_eq!(client.round2().unwrap().len(), 165);
        let s2 = server.round2().unwrap();
        assert_eq!(s2.len(), 168);
        assert_eq!(&s2[..3], &[0x03, 0x00, 0x17]);
    }

    #[test]
    fn test_same_password_agrees() {
        let (c, s) = exchange(b"123456", b"123456");
        assert_eq!(c, s);
    }

    #[test]
    fn test_different_password_disagrees() {
        let (c, s) = exchange(b"123456", b"654321");
        assert_ne!(c, s);
    }

    #[test]
    fn test_tampered_round1_rejected() {
        let client = JpakeEngine::new(Role::Client, b"123456").unwrap();
        let mut server = JpakeEngine::new(Role::Server, b"123456").unwrap();
        let mut c1 = client.round1().to_vec();
        // flip a bit inside the first proof scalar
        c1[150] ^= 0x01;
        assert!(matches!(server.read_round1(&c1), Err(PumpError::Jpake(_))));
    }

    #[test]
    fn test_wrong_role_id_rejected() {
        // a client reading another client's round 1 checks the proof against "server"
        let a = JpakeEngine::new(Role::Client, b"123456").unwrap();
        let mut b = JpakeEngine::new(Role::Client, b"123456").unwrap();
        assert!(b.read_round1(&a.round1()).is_err());
    }

    #[test]
    fn test_out_of_order_calls() {
        let client = JpakeEngine::new(Role::Client, b"123456").unwrap();
        assert!(client.round2().is_err());
        assert!(client.derive_secret().is_err());
    }

    #[test]
    fn test_client_requires_ec_parameters() {
        let mut client = JpakeEngine::new(Role::Client, b"123456").unwrap();
        let mut server = JpakeEngine::new(Role::Server, b"123456").unwrap();
        client.read_round1(&server.round1()).unwrap();
        server.read_round1(&client.round1()).unwrap();
        let s2 = server.round2().unwrap();
        assert!(client.read_round2(&s2[3..]).is_err());
    }

    #[test]
    fn test_invalid_passwords() {
        assert!(JpakeEngine::new(Role::Client, b"").is_err());
        assert!(JpakeEngine::new(Role::Client, &[0u8; 6]).is_err());
        assert!(JpakeEngine::new(Role::Client, &[1u8; 33]).is_err());
    }
}
