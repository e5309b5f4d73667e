use super::{Hash, HashType};
use crypto::digest::Digest;
use crypto::md5::Md5;
use crypto::sha1::Sha1;
use crypto::sha2::{Sha256, Sha512};

/// An incremental digest, tracking how many bytes were fed.
pub struct Context {
  inner: Inner,
  len: u64,
}

enum Inner {
  Md5(Md5),
  Sha1(Sha1),
  Sha256(Sha256),
  Sha512(Sha512),
}

impl Context {
  pub fn new(ty: HashType) -> Self {
    let inner = match ty {
      HashType::MD5 => Inner::Md5(Md5::new()),
      HashType::SHA1 => Inner::Sha1(Sha1::new()),
      HashType::SHA256 => Inner::Sha256(Sha256::new()),
      HashType::SHA512 => Inner::Sha512(Sha512::new()),
    };
    Self { inner, len: 0 }
  }

  pub fn ty(&self) -> HashType {
    match self.inner {
      Inner::Md5(_) => HashType::MD5,
      Inner::Sha1(_) => HashType::SHA1,
      Inner::Sha256(_) => HashType::SHA256,
      Inner::Sha512(_) => HashType::SHA512,
    }
  }

  pub fn input(&mut self, data: &[u8]) {
    self.len += data.len() as u64;
    match &mut self.inner {
      Inner::Md5(d) => d.input(data),
      Inner::Sha1(d) => d.input(data),
      Inner::Sha256(d) => d.input(data),
      Inner::Sha512(d) => d.input(data),
    }
  }

  pub fn finish(mut self) -> (Hash, u64) {
    let ty = self.ty();
    let mut out = [0u8; 64];
    match &mut self.inner {
      Inner::Md5(d) => d.result(&mut out[..16]),
      Inner::Sha1(d) => d.result(&mut out[..20]),
      Inner::Sha256(d) => d.result(&mut out[..32]),
      Inner::Sha512(d) => d.result(&mut out[..64]),
    }
    (Hash::from_raw(&out[..ty.size()], ty), self.len)
  }
}
