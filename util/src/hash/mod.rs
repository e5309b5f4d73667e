use crate::break_str;
use anyhow::{anyhow, bail, ensure, Result};
use std::borrow::Cow;
use std::fmt::{self, Debug};
use std::fs::File;
use std::hash as stdhash;
use std::path::Path;
use std::str::FromStr;

mod context;
mod sink;

pub use context::Context;
pub use sink::{ModuloSink, Sink};

/// A digest tagged with its algorithm. Stored inline; `len` is the number
/// of live bytes in `data`.
#[derive(Clone, Copy)]
pub struct Hash {
  data: [u8; 64],
  len: usize,
  ty: HashType,
}

impl Hash {
  pub fn hash<S: AsRef<[u8]>>(bytes: S, ty: HashType) -> Self {
    let mut ctx = Context::new(ty);
    ctx.input(bytes.as_ref());
    ctx.finish().0
  }

  pub fn hash_file<P: AsRef<Path>>(path: P, ty: HashType) -> Result<(Self, u64)> {
    let mut sink = Sink::new(ty, std::io::sink());
    std::io::copy(&mut File::open(path)?, &mut sink)?;
    let (_, hash, len) = sink.finish();
    Ok((hash, len))
  }

  pub(crate) fn from_raw(bytes: &[u8], ty: HashType) -> Self {
    let mut data = [0; 64];
    data[..bytes.len()].copy_from_slice(bytes);
    Self {
      data,
      len: bytes.len(),
      ty,
    }
  }

  pub fn ty(&self) -> HashType {
    self.ty
  }

  pub fn size(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn as_bytes(&self) -> &[u8] {
    &self.data[..self.len]
  }

  /// XOR-fold the digest down to `new_size` bytes. The store compresses
  /// path hashes to 20 bytes this way.
  pub fn truncate(&self, new_size: usize) -> Cow<Self> {
    if new_size >= self.len {
      return Cow::Borrowed(self);
    }
    let mut data = [0; 64];
    for i in 0..self.len {
      data[i % new_size] ^= self.data[i];
    }
    Cow::Owned(Self {
      data,
      len: new_size,
      ty: self.ty,
    })
  }

  pub fn encode(&self, encoding: Encoding) -> String {
    if encoding == Encoding::SRI {
      return self.encode_with_type(encoding);
    }
    let mut buf = String::new();
    self.encode_into(encoding, &mut buf);
    buf
  }

  pub fn encode_with_type(&self, encoding: Encoding) -> String {
    let mut buf = self.ty.to_string();
    buf.push(if encoding == Encoding::SRI { '-' } else { ':' });
    self.encode_into(encoding, &mut buf);
    buf
  }

  fn encode_into(&self, encoding: Encoding, buf: &mut String) {
    match encoding {
      Encoding::Base16 => {
        let mut bytes = vec![0; len_base16(self.len)];
        binascii::bin2hex(self.as_bytes(), &mut bytes).expect("incorrect buffer size");
        buf.push_str(unsafe { std::str::from_utf8_unchecked(&bytes) });
      }
      Encoding::Base32 => buf.push_str(&crate::base32::encode(self.as_bytes())),
      Encoding::Base64 | Encoding::SRI => {
        let mut bytes = vec![0; len_base64(self.len)];
        binascii::b64encode(self.as_bytes(), &mut bytes).expect("incorrect buffer size");
        buf.push_str(unsafe { std::str::from_utf8_unchecked(&bytes) });
      }
    }
  }

  /// Parse a hash whose algorithm is embedded, either `<ty>:<hash>` or the
  /// SRI form `<ty>-<base64>`.
  pub fn decode<S: AsRef<str>>(input: S) -> Result<Self> {
    let input = input.as_ref();
    if let Some((ty, rest)) = break_str(input, ':') {
      Self::decode_with_type(rest, ty.parse()?, false)
    } else if let Some((ty, rest)) = break_str(input, '-') {
      Self::decode_with_type(rest, ty.parse()?, true)
    } else {
      bail!("hash `{}' does not include a type", input)
    }
  }

  /// Parse a bare hash body; the base is chosen by length.
  pub fn decode_with_type(input: &str, ty: HashType, sri: bool) -> Result<Self> {
    let mut bytes = [0; 64];
    if !sri && input.len() == len_base16(ty.size()) {
      binascii::hex2bin(input.as_bytes(), &mut bytes)
        .map_err(|e| anyhow!("invalid base16 hash: {:?}", e))?;
    } else if !sri && input.len() == len_base32(ty.size()) {
      crate::base32::decode_into(input.as_bytes(), &mut bytes[..ty.size()])?;
    } else if sri || input.len() == len_base64(ty.size()) {
      base64::decode_config_slice(input, base64::STANDARD, &mut bytes)?;
    } else {
      bail!("hash `{}' has wrong length for type `{}'", input, ty);
    }
    Ok(Self {
      data: bytes,
      len: ty.size(),
      ty,
    })
  }

  /// Accept `""` as the all-zero hash when a type is known; otherwise
  /// parse, cross-checking the embedded type when both are present.
  pub fn new_allow_empty(s: &str, ty: Option<HashType>) -> Result<Self> {
    if s.is_empty() {
      let ty = ty.ok_or_else(|| anyhow!("empty hash requires an explicit type"))?;
      Ok(Self {
        data: [0; 64],
        len: ty.size(),
        ty,
      })
    } else {
      match ty {
        Some(ty) => {
          if s.contains(|c| c == ':' || c == '-') {
            let parsed = Self::decode(s)?;
            ensure!(
              parsed.ty() == ty,
              "expected hash type `{}', got `{}'",
              ty,
              parsed.ty()
            );
            Ok(parsed)
          } else {
            Self::decode_with_type(s, ty, false)
          }
        }
        None => Self::decode(s),
      }
    }
  }
}

impl PartialEq for Hash {
  fn eq(&self, other: &Self) -> bool {
    self.ty == other.ty && self.as_bytes() == other.as_bytes()
  }
}

impl Eq for Hash {}

impl stdhash::Hash for Hash {
  fn hash<H: stdhash::Hasher>(&self, state: &mut H) {
    self.as_bytes().hash(state)
  }
}

impl PartialOrd for Hash {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Hash {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    (self.ty as u8, self.as_bytes()).cmp(&(other.ty as u8, other.as_bytes()))
  }
}

impl Debug for Hash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Hash")
      .field(&self.encode_with_type(Encoding::Base32))
      .finish()
  }
}

fn len_base16(size: usize) -> usize {
  size * 2
}

fn len_base32(size: usize) -> usize {
  (size * 8 - 1) / 5 + 1
}

fn len_base64(size: usize) -> usize {
  ((4 * size / 3) + 3) & !3
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display)]
pub enum HashType {
  #[display(fmt = "md5")]
  MD5,
  #[display(fmt = "sha1")]
  SHA1,
  #[display(fmt = "sha256")]
  SHA256,
  #[display(fmt = "sha512")]
  SHA512,
}

impl HashType {
  pub fn size(self) -> usize {
    match self {
      Self::MD5 => 16,
      Self::SHA1 => 20,
      Self::SHA256 => 32,
      Self::SHA512 => 64,
    }
  }
}

impl FromStr for HashType {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s {
      "md5" => Self::MD5,
      "sha1" => Self::SHA1,
      "sha256" => Self::SHA256,
      "sha512" => Self::SHA512,
      x => bail!("unknown hash algorithm `{}'", x),
    })
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Encoding {
  Base16,
  Base32,
  Base64,
  SRI,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_sha256() {
    let h = Hash::hash("", HashType::SHA256);
    assert_eq!(
      h.encode(Encoding::Base16),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(
      h.encode(Encoding::Base32),
      "0mdqa9w1p6cmli6976v4wi0sw9r4p5prkj7lzfd1877wk11c9c73"
    );
    assert_eq!(
      h.encode_with_type(Encoding::Base64),
      "sha256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
    );
  }

  #[test]
  fn decode_by_length() {
    let h = Hash::hash("abc", HashType::SHA256);
    for enc in [Encoding::Base16, Encoding::Base32, Encoding::Base64] {
      assert_eq!(
        Hash::decode_with_type(&h.encode(enc), HashType::SHA256, false).unwrap(),
        h
      );
    }
    assert_eq!(Hash::decode(h.encode_with_type(Encoding::Base32)).unwrap(), h);
    assert_eq!(Hash::decode(h.encode_with_type(Encoding::SRI)).unwrap(), h);
  }

  #[test]
  fn truncation_folds() {
    let h = Hash::hash("hello", HashType::SHA256);
    let t = h.truncate(20);
    assert_eq!(t.size(), 20);
    let mut expected = [0u8; 20];
    for (i, b) in h.as_bytes().iter().enumerate() {
      expected[i % 20] ^= *b;
    }
    assert_eq!(t.as_bytes(), &expected[..]);
    // truncating to the full size is the identity
    assert_eq!(h.truncate(32).as_bytes(), h.as_bytes());
  }

  #[test]
  fn unknown_algo() {
    assert!("blake3".parse::<HashType>().is_err());
  }
}
