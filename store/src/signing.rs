//! Detached ed25519 signatures over path fingerprints. Key files hold
//! `<name>:<base64 payload>` where the payload is a 32-byte seed or a
//! 64-byte keypair.

use crate::prelude::*;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::BTreeMap;
use std::path::Path;

pub struct SecretKey {
  name: String,
  key: SigningKey,
}

impl SecretKey {
  pub fn parse(s: &str) -> Result<Self> {
    let (name, payload) = split_key(s)?;
    let bytes = base64::decode(payload.trim())?;
    let key = match bytes.len() {
      32 => SigningKey::from_bytes(&bytes.try_into().unwrap()),
      64 => SigningKey::from_keypair_bytes(&bytes.try_into().unwrap())
        .map_err(|e| anyhow!("invalid keypair for `{}': {}", name, e))?,
      n => bail!("secret key must be 32 or 64 bytes, not {}", n),
    };
    Ok(Self {
      name: name.to_string(),
      key,
    })
  }

  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
    Self::parse(std::fs::read_to_string(path)?.trim_end())
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// `<name>:<base64 signature>` over `msg`.
  pub fn sign_detached(&self, msg: &str) -> String {
    let sig = self.key.sign(msg.as_bytes());
    format!("{}:{}", self.name, base64::encode(sig.to_bytes()))
  }

  pub fn to_public(&self) -> PublicKey {
    PublicKey {
      name: self.name.clone(),
      key: self.key.verifying_key(),
    }
  }
}

#[derive(Clone)]
pub struct PublicKey {
  name: String,
  key: VerifyingKey,
}

impl PublicKey {
  pub fn parse(s: &str) -> Result<Self> {
    let (name, payload) = split_key(s)?;
    let bytes = base64::decode(payload.trim())?;
    let bytes: [u8; 32] = bytes
      .try_into()
      .map_err(|v: Vec<u8>| anyhow!("public key must be 32 bytes, not {}", v.len()))?;
    Ok(Self {
      name: name.to_string(),
      key: VerifyingKey::from_bytes(&bytes)?,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn render(&self) -> String {
    format!("{}:{}", self.name, base64::encode(self.key.to_bytes()))
  }
}

pub type PublicKeys = BTreeMap<String, PublicKey>;

/// Check one `<name>:<base64 sig>` signature against the key of the same
/// name, if supplied.
pub fn verify_detached(msg: &str, sig: &str, keys: &PublicKeys) -> bool {
  let (name, payload) = match split_key(sig) {
    Ok(parts) => parts,
    Err(_) => return false,
  };
  let key = match keys.get(name) {
    Some(key) => key,
    None => return false,
  };
  let bytes = match base64::decode(payload) {
    Ok(b) => b,
    Err(_) => return false,
  };
  let sig = match ed25519_dalek::Signature::from_slice(&bytes) {
    Ok(s) => s,
    Err(_) => return false,
  };
  key.key.verify(msg.as_bytes(), &sig).is_ok()
}

fn split_key(s: &str) -> Result<(&str, &str)> {
  let (name, payload) = break_str(s, ':').ok_or_else(|| anyhow!("key does not contain a `:'"))?;
  ensure!(!name.is_empty(), "key name cannot be empty");
  Ok((name, payload))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_key() -> SecretKey {
    let seed = [7u8; 32];
    SecretKey {
      name: "test-1".into(),
      key: SigningKey::from_bytes(&seed),
    }
  }

  #[test]
  fn sign_and_verify() {
    let sk = test_key();
    let sig = sk.sign_detached("fingerprint");

    let mut keys = PublicKeys::new();
    let pk = sk.to_public();
    keys.insert(pk.name().to_string(), pk);

    assert!(verify_detached("fingerprint", &sig, &keys));
    assert!(!verify_detached("other message", &sig, &keys));
    assert!(!verify_detached("fingerprint", "unknown:AAAA", &keys));
  }

  #[test]
  fn keys_roundtrip_through_text() {
    let sk = test_key();
    let pk = sk.to_public();
    let parsed = PublicKey::parse(&pk.render()).unwrap();
    assert_eq!(parsed.render(), pk.render());

    let sig = sk.sign_detached("msg");
    let mut keys = PublicKeys::new();
    keys.insert(parsed.name().to_string(), parsed);
    assert!(verify_detached("msg", &sig, &keys));
  }
}
