use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::Deserialize;
use sha2::{Digest as ShaDigest, Sha256};

use super::error::CryptoError;

pub type Digest = [u8; 32];

pub const CURVE_NAME: &str = "P-256";

/// Addresses are the first bytes of the public key hash.
const ADDRESS_LEN: usize = 20;

const COORDINATE_LEN: usize = 32;

pub trait Hashable {
    fn hash(&self) -> Digest;
}

pub struct Keypair {
    pubkey: Pubkey,
    ecdsa_signer: SigningKey,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Pubkey {
    key: VerifyingKey,
}

/// JSON shape of a public key as carried in `SignInfo::public_key`: the
/// curve name and the affine coordinates of the point, hex encoded.
#[derive(Deserialize)]
struct JsonPubkey {
    #[serde(rename = "Curvname")]
    curve: String,
    #[serde(rename = "X")]
    x: String,
    #[serde(rename = "Y")]
    y: String,
}

impl Keypair {
    pub fn new_pair() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::random(&mut csprng))
    }

    /// Deterministic keypair, used by tests and local clusters. The seed is
    /// hashed until it lands on a valid scalar.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let mut candidate = sha256(seed);
        loop {
            if let Ok(signer) = SigningKey::from_slice(&candidate) {
                return Self::from_signing_key(signer);
            }
            candidate = sha256(&candidate);
        }
    }

    fn from_signing_key(ecdsa_signer: SigningKey) -> Self {
        let pubkey = Pubkey {
            key: *ecdsa_signer.verifying_key(),
        };
        Keypair {
            pubkey,
            ecdsa_signer,
        }
    }

    /// DER encoded ECDSA signature over `digest`.
    pub fn sign(&self, digest: &Digest) -> Vec<u8> {
        let sig: Signature = self.ecdsa_signer.sign(digest);
        sig.to_der().as_bytes().to_vec()
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    pub fn address(&self) -> String {
        self.pubkey.address()
    }

    pub fn public_key_json(&self) -> String {
        self.pubkey.to_json()
    }
}

impl Pubkey {
    /// Uncompressed SEC1 encoding: `0x04 || X || Y`.
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.key.to_encoded_point(false).as_bytes().to_vec()
    }

    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|err| CryptoError::InvalidPublicKey(err.to_string()))?;
        Ok(Pubkey { key })
    }

    pub fn address(&self) -> String {
        hex::encode(&sha256(&self.to_sec1_bytes())[..ADDRESS_LEN])
    }

    pub fn to_json(&self) -> String {
        let sec1 = self.to_sec1_bytes();
        let (x, y) = sec1[1..].split_at(COORDINATE_LEN);
        // formatting a json Value never fails
        serde_json::json!({
            "Curvname": CURVE_NAME,
            "X": hex::encode(x),
            "Y": hex::encode(y),
        })
        .to_string()
    }

    pub fn from_json(raw: &str) -> Result<Self, CryptoError> {
        let json: JsonPubkey = serde_json::from_str(raw)
            .map_err(|err| CryptoError::InvalidPublicKey(err.to_string()))?;
        if json.curve != CURVE_NAME {
            return Err(CryptoError::InvalidPublicKey(format!(
                "unsupported curve {}",
                json.curve
            )));
        }
        let mut sec1 = Vec::with_capacity(1 + 2 * COORDINATE_LEN);
        sec1.push(0x04);
        for coordinate in [&json.x, &json.y] {
            let bytes = hex::decode(coordinate)
                .map_err(|err| CryptoError::InvalidPublicKey(err.to_string()))?;
            if bytes.len() != COORDINATE_LEN {
                return Err(CryptoError::InvalidPublicKey(format!(
                    "coordinate length {}",
                    bytes.len()
                )));
            }
            sec1.extend_from_slice(&bytes);
        }
        Self::from_sec1_bytes(&sec1)
    }

    pub fn verify(&self, digest: &Digest, sig: &[u8]) -> Result<(), CryptoError> {
        let ecdsa_sig = Signature::from_der(sig)
            .map_err(|err| CryptoError::MalformedSignature(err.to_string()))?;
        self.key
            .verify(digest, &ecdsa_sig)
            .map_err(|_| CryptoError::BadSignature)
    }
}

/// Checks that `address` is derived from `public_key` and that `sig` signs `digest`.
pub fn verify_with_address(
    address: &str,
    public_key: &str,
    sig: &[u8],
    digest: &Digest,
) -> Result<(), CryptoError> {
    let pubkey = Pubkey::from_json(public_key)?;
    if pubkey.address() != address {
        return Err(CryptoError::AddressMismatch(address.to_string()));
    }
    pubkey.verify(digest, sig)
}

pub fn sha256(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn double_sha256(data: &[u8]) -> Digest {
    sha256(&sha256(data))
}
