use crate::prelude::*;
use std::cmp::Ordering;
use std::convert::TryInto;
use std::fmt::{self, Debug, Display};
use std::ops::Deref;
use std::str::FromStr;

pub const HASH_BYTES: usize = 20;
pub const HASH_CHARS: usize = 32;

pub const DRV_EXTENSION: &str = ".drv";

/// `<hash>-<name>`, the basename of a store object. The hash part is the
/// base32 rendering of a 20-byte compressed SHA-256.
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Debug, Display, Hash)]
#[display(fmt = "{}-{}", hash, name)]
pub struct StorePath {
  hash: PathHash,
  name: PathName,
}

impl StorePath {
  pub fn from_base_name<S: AsRef<str>>(base_name: S) -> Result<Self> {
    let base_name = base_name.as_ref();
    ensure!(
      base_name.len() > HASH_CHARS && base_name.as_bytes()[HASH_CHARS] == b'-',
      "invalid filename for store path: `{}'",
      base_name
    );

    Ok(Self {
      hash: base_name[..HASH_CHARS].parse()?,
      name: base_name[HASH_CHARS + 1..].parse()?,
    })
  }

  pub(crate) fn from_parts(bytes: &[u8], name: &str) -> Result<Self> {
    Ok(Self {
      hash: PathHash(bytes.try_into()?),
      name: name.parse()?,
    })
  }

  pub fn name(&self) -> &str {
    &self.name.0
  }

  pub fn hash_part(&self) -> String {
    self.hash.to_string()
  }

  pub fn is_derivation(&self) -> bool {
    self.name.ends_with(DRV_EXTENSION)
  }

  /// The derivation name with the `.drv` suffix stripped.
  pub fn derivation_name(&self) -> Result<&str> {
    self
      .name
      .strip_suffix(DRV_EXTENSION)
      .ok_or_else(|| anyhow!("store path `{}' does not refer to a derivation", self))
  }
}

#[derive(Copy, Clone, Hash, Eq, PartialEq)]
pub struct PathHash([u8; HASH_BYTES]);

impl PathHash {
  pub fn decode<S: AsRef<str>>(s: S) -> Result<Self> {
    let s = s.as_ref();
    ensure!(s.len() == HASH_CHARS, "invalid store path hash `{}'", s);
    let bytes = base32::decode(s.as_bytes())?;
    Ok(Self(bytes[..HASH_BYTES].try_into().unwrap()))
  }
}

impl FromStr for PathHash {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::decode(s)
  }
}

impl Display for PathHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&base32::encode(&self.0))
  }
}

impl Debug for PathHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("PathHash").field(&self.to_string()).finish()
  }
}

impl PartialOrd for PathHash {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for PathHash {
  // base32 renders the bytes backwards; sort to match the rendered form
  fn cmp(&self, other: &Self) -> Ordering {
    self.0.iter().rev().cmp(other.0.iter().rev())
  }
}

#[derive(Clone, Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Display)]
pub struct PathName(String);

impl PathName {
  pub fn decode<S: AsRef<str>>(s: S) -> Result<Self> {
    fn valid_char(c: char) -> bool {
      c.is_ascii_alphanumeric() || "+-._?=".contains(c)
    }

    let s = s.as_ref();
    ensure!(!s.is_empty(), "store path name cannot be empty");
    ensure!(s.len() <= 211, "store path name is too long");
    ensure!(
      !s.starts_with('.') && s.chars().all(valid_char),
      "invalid characters in store path name `{}'",
      s
    );
    Ok(Self(s.into()))
  }
}

impl FromStr for PathName {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::decode(s)
  }
}

impl Deref for PathName {
  type Target = str;

  fn deref(&self) -> &str {
    &self.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_well_formed_base_names() {
    let p =
      StorePath::from_base_name("x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88-foo-1.2.3").unwrap();
    assert_eq!(p.name(), "foo-1.2.3");
    assert_eq!(p.hash_part(), "x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88");
    assert_eq!(
      p.to_string(),
      "x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88-foo-1.2.3"
    );
  }

  #[test]
  fn rejects_malformed_base_names() {
    // no separator
    assert!(StorePath::from_base_name("x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88").is_err());
    // hash part too short
    assert!(StorePath::from_base_name("abc-foo").is_err());
    // invalid base32 ('e' is not in the alphabet)
    assert!(StorePath::from_base_name("exxf8v9fxf3jk8zln1cwlsrmhqvp0f88-foo").is_err());
    // bad name characters
    assert!(StorePath::from_base_name("x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88-f!oo").is_err());
    assert!(StorePath::from_base_name("x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88-.hidden").is_err());
  }

  #[test]
  fn ordering_matches_rendered_form() {
    let a = StorePath::from_base_name("00000000000000000000000000000001-a").unwrap();
    let b = StorePath::from_base_name("10000000000000000000000000000000-a").unwrap();
    assert_eq!(
      a.cmp(&b),
      a.to_string().cmp(&b.to_string()),
      "path order must agree with string order"
    );
  }

  proptest::proptest! {
    #[test]
    fn base_name_roundtrip(
      bytes: [u8; HASH_BYTES],
      name in "[a-z0-9+_?=][a-z0-9+._?=-]{0,30}",
    ) {
      let path = StorePath::from_parts(&bytes, &name).unwrap();
      let reparsed = StorePath::from_base_name(path.to_string()).unwrap();
      proptest::prop_assert_eq!(path, reparsed);
    }
  }

  #[test]
  fn derivation_names() {
    let p = StorePath::from_base_name("x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88-foo.drv").unwrap();
    assert!(p.is_derivation());
    assert_eq!(p.derivation_name().unwrap(), "foo");

    let q = StorePath::from_base_name("x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88-foo").unwrap();
    assert!(!q.is_derivation());
    assert!(q.derivation_name().is_err());
  }
}
