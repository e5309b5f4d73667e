//! The content-address vocabulary: how the store writes down "these bytes
//! are named by their own hash". The mini form tags a bare hash with its
//! ingestion scheme; the full form adds the object's name and references
//! so a store path can be recomputed from it.

use crate::prelude::*;
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FileIngestionMethod {
  Flat,
  Recursive,
  Git,
}

impl FileIngestionMethod {
  pub fn prefix(&self) -> &'static str {
    match self {
      Self::Flat => "",
      Self::Recursive => "r:",
      Self::Git => "git:",
    }
  }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TextHash(pub Hash);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FixedOutputHash {
  pub method: FileIngestionMethod,
  pub hash: Hash,
}

impl FixedOutputHash {
  /// `r:sha256`, `git:sha1`, `sha256`, ... as it appears in derivation
  /// output fields and rendered addresses.
  pub fn method_algo(&self) -> String {
    format!("{}{}", self.method.prefix(), self.hash.ty())
  }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct IpfsHash(pub Hash);

impl IpfsHash {
  /// The base16 CID form used as the inner key of an ipfs store path.
  pub fn cid(&self) -> String {
    format!("f01711220{}", self.0.encode(Encoding::Base16))
  }
}

/// A content address without name or references, as stored in path-info
/// records and sent over the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, EnumAsInner)]
pub enum ContentAddress {
  Text(TextHash),
  Fixed(FixedOutputHash),
  Ipfs(IpfsHash),
}

impl Display for ContentAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Text(t) => write!(f, "text:{}", t.0.encode_with_type(Encoding::Base32)),
      Self::Fixed(fo) => write!(
        f,
        "fixed:{}{}",
        fo.method.prefix(),
        fo.hash.encode_with_type(Encoding::Base32)
      ),
      Self::Ipfs(i) => write!(f, "ipfs:{}", i.cid()),
    }
  }
}

impl FromStr for ContentAddress {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    let (prefix, rest) =
      break_str(s, ':').ok_or_else(|| anyhow!("`{}' lacks a content address prefix", s))?;

    match prefix {
      "text" => {
        let hash = Hash::decode(rest)?;
        ensure!(hash.ty() == HashType::SHA256, "text hash must be SHA-256");
        Ok(Self::Text(TextHash(hash)))
      }
      "fixed" => {
        let (method, rest) = if let Some(r) = rest.strip_prefix("r:") {
          (FileIngestionMethod::Recursive, r)
        } else if let Some(r) = rest.strip_prefix("git:") {
          (FileIngestionMethod::Git, r)
        } else {
          (FileIngestionMethod::Flat, rest)
        };
        Ok(Self::Fixed(FixedOutputHash {
          method,
          hash: Hash::decode(rest)?,
        }))
      }
      "ipfs" => {
        let raw = rest
          .strip_prefix("f01711220")
          .ok_or_else(|| anyhow!("`{}' is not a supported ipfs address", rest))?;
        Ok(Self::Ipfs(IpfsHash(Hash::decode_with_type(
          raw,
          HashType::SHA256,
          false,
        )?)))
      }
      _ => bail!("unrecognized content address prefix `{}'", prefix),
    }
  }
}

impl ContentAddress {
  /// The empty string denotes "no content address" on the wire.
  pub fn parse_opt(s: &str) -> Result<Option<Self>> {
    if s.is_empty() {
      Ok(None)
    } else {
      Ok(Some(s.parse()?))
    }
  }

  pub fn render_opt(ca: Option<&Self>) -> String {
    ca.map_or_else(String::new, |c| c.to_string())
  }
}

/// A reference set kept separate from the owner's own identity. The owner
/// never appears in `references`; a self-reference is the flag instead, so
/// hashing and fingerprinting can treat it specially.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathReferences<R> {
  pub references: BTreeSet<R>,
  pub has_self_reference: bool,
}

impl<R> Default for PathReferences<R> {
  fn default() -> Self {
    Self {
      references: BTreeSet::new(),
      has_self_reference: false,
    }
  }
}

impl<R: Ord + Clone> PathReferences<R> {
  pub fn is_empty(&self) -> bool {
    self.references.is_empty() && !self.has_self_reference
  }

  /// Re-materialise the references as one set including `this` when the
  /// self-reference flag is set.
  pub fn possibly_to_self(&self, this: &R) -> BTreeSet<R> {
    let mut refs = self.references.clone();
    if self.has_self_reference {
      refs.insert(this.clone());
    }
    refs
  }

  pub fn insert_possibly_to_self(&mut self, this: &R, reference: R) {
    if &reference == this {
      self.has_self_reference = true;
    } else {
      self.references.insert(reference);
    }
  }

  pub fn set_possibly_to_self(&mut self, this: &R, mut refs: BTreeSet<R>) {
    self.has_self_reference = refs.remove(this);
    self.references = refs;
  }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TextInfo {
  pub hash: Hash,
  /// Self-references are forbidden for text paths.
  pub references: StorePathSet,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FixedOutputInfo {
  pub method: FileIngestionMethod,
  pub hash: Hash,
  pub references: PathReferences<StorePath>,
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct IpfsRef {
  pub name: String,
  pub hash: IpfsHash,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IpfsInfo {
  pub hash: IpfsHash,
  pub references: PathReferences<IpfsRef>,
}

#[derive(Clone, Debug, Eq, PartialEq, EnumAsInner)]
pub enum CaInfo {
  Text(TextInfo),
  Fixed(FixedOutputInfo),
  Ipfs(IpfsInfo),
}

/// A content address plus the name and references needed to recompute the
/// store path it denotes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContentAddressWithRefs {
  pub name: String,
  pub info: CaInfo,
}

impl ContentAddressWithRefs {
  /// Forget name and references, keeping only the wire form.
  pub fn mini(&self) -> ContentAddress {
    match &self.info {
      CaInfo::Text(t) => ContentAddress::Text(TextHash(t.hash)),
      CaInfo::Fixed(f) => ContentAddress::Fixed(FixedOutputHash {
        method: f.method,
        hash: f.hash,
      }),
      CaInfo::Ipfs(i) => ContentAddress::Ipfs(i.hash),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sha256(s: &str) -> Hash {
    Hash::hash(s, HashType::SHA256)
  }

  #[test]
  fn render_parse_roundtrip() {
    let cases = [
      ContentAddress::Text(TextHash(sha256("hello"))),
      ContentAddress::Fixed(FixedOutputHash {
        method: FileIngestionMethod::Flat,
        hash: sha256("a"),
      }),
      ContentAddress::Fixed(FixedOutputHash {
        method: FileIngestionMethod::Recursive,
        hash: sha256("b"),
      }),
      ContentAddress::Fixed(FixedOutputHash {
        method: FileIngestionMethod::Git,
        hash: Hash::hash("c", HashType::SHA1),
      }),
      ContentAddress::Ipfs(IpfsHash(sha256("d"))),
    ];

    for ca in cases {
      let rendered = ca.to_string();
      let parsed: ContentAddress = rendered.parse().unwrap();
      assert_eq!(parsed, ca);
      assert_eq!(parsed.to_string(), rendered);
    }
  }

  #[test]
  fn parse_rejects_bad_addresses() {
    assert!("no-prefix".parse::<ContentAddress>().is_err());
    assert!("frob:sha256:abc".parse::<ContentAddress>().is_err());
    // text addresses must be sha256
    let sha1 = Hash::hash("x", HashType::SHA1).encode_with_type(Encoding::Base32);
    assert!(format!("text:{}", sha1).parse::<ContentAddress>().is_err());
  }

  #[test]
  fn optional_form_is_empty_string() {
    assert_eq!(ContentAddress::parse_opt("").unwrap(), None);
    assert_eq!(ContentAddress::render_opt(None), "");
    let ca = ContentAddress::Text(TextHash(sha256("t")));
    assert_eq!(
      ContentAddress::parse_opt(&ContentAddress::render_opt(Some(&ca))).unwrap(),
      Some(ca)
    );
  }

  #[test]
  fn self_reference_is_a_flag_not_a_member() {
    let this = StorePath::from_base_name("00000000000000000000000000000000-self").unwrap();
    let other = StorePath::from_base_name("10000000000000000000000000000000-dep").unwrap();

    let mut refs = PathReferences::<StorePath>::default();
    refs.insert_possibly_to_self(&this, this.clone());
    refs.insert_possibly_to_self(&this, other.clone());

    assert!(refs.has_self_reference);
    assert!(!refs.references.contains(&this));

    let view = refs.possibly_to_self(&this);
    assert!(view.contains(&this) && view.contains(&other));

    let mut refs2 = PathReferences::<StorePath>::default();
    refs2.set_possibly_to_self(&this, view);
    assert_eq!(refs, refs2);
  }
}
