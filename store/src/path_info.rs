use crate::prelude::*;
use crate::signing::{verify_detached, PublicKeys, SecretKey};
use std::collections::BTreeSet;
use std::time::SystemTime;

/// Returned by `check_signatures` for paths that prove their own identity
/// by being verifiably content-addressed.
pub const MAX_SIGS: usize = usize::MAX;

/// Everything the store knows about a valid path. Immutable once it enters
/// the path-info cache; callers get a shared view.
#[derive(Debug, Clone)]
pub struct ValidPathInfo {
  pub path: StorePath,
  pub deriver: Option<StorePath>,
  pub nar_hash: Option<Hash>,
  pub nar_size: Option<u64>,
  pub refs: PathReferences<StorePath>,
  pub registration_time: Option<SystemTime>,
  /// Built locally rather than substituted; never survives a copy.
  pub ultimate: bool,
  pub sigs: BTreeSet<String>,
  pub ca: Option<ContentAddress>,
}

impl ValidPathInfo {
  pub fn new(path: StorePath, nar_hash: Hash) -> Self {
    Self {
      path,
      deriver: None,
      nar_hash: Some(nar_hash),
      nar_size: None,
      refs: Default::default(),
      registration_time: None,
      ultimate: false,
      sigs: Default::default(),
      ca: None,
    }
  }

  /// Construct the info a full content address denotes in `store`,
  /// computing the path it must land at.
  pub fn from_ca<S: Store + ?Sized>(store: &S, ca: ContentAddressWithRefs) -> Result<Self> {
    let path = store.make_fixed_output_path_from_ca(&ca)?;
    let mut info = Self {
      path,
      deriver: None,
      nar_hash: None,
      nar_size: None,
      refs: Default::default(),
      registration_time: None,
      ultimate: false,
      sigs: Default::default(),
      ca: Some(ca.mini()),
    };
    match ca.info {
      CaInfo::Text(t) => {
        info.refs.references = t.references;
      }
      CaInfo::Fixed(f) => {
        info.refs = f.references;
      }
      CaInfo::Ipfs(i) => {
        // ipfs references name other ipfs objects; they have no store
        // path rendering here, only the self flag carries over
        info.refs.has_self_reference = i.references.has_self_reference;
      }
    }
    Ok(info)
  }

  pub fn references_possibly_to_self(&self) -> StorePathSet {
    self.refs.possibly_to_self(&self.path)
  }

  pub fn insert_reference_possibly_to_self(&mut self, reference: StorePath) {
    let this = self.path.clone();
    self.refs.insert_possibly_to_self(&this, reference)
  }

  pub fn set_references_possibly_to_self(&mut self, refs: StorePathSet) {
    let this = self.path.clone();
    self.refs.set_possibly_to_self(&this, refs)
  }

  /// The canonical string that signatures attest to:
  /// `1;<path>;<narHash>;<narSize>;<refs>`.
  pub fn fingerprint<S: Store + ?Sized>(&self, store: &S) -> Result<String> {
    let nar_hash = self.nar_hash.ok_or_else(|| {
      anyhow!(
        "cannot calculate fingerprint of path `{}' because its hash is not known",
        store.print_store_path(&self.path)
      )
    })?;
    let nar_size = self.nar_size.filter(|s| *s > 0).ok_or_else(|| {
      anyhow!(
        "cannot calculate fingerprint of path `{}' because its size is not known",
        store.print_store_path(&self.path)
      )
    })?;

    Ok(format!(
      "1;{};{};{};{}",
      store.print_store_path(&self.path),
      nar_hash.encode_with_type(Encoding::Base32),
      nar_size,
      self
        .references_possibly_to_self()
        .iter()
        .map(|r| store.print_store_path(r))
        .collect::<Vec<_>>()
        .join(",")
    ))
  }

  pub fn sign<S: Store + ?Sized>(&mut self, store: &S, key: &SecretKey) -> Result<()> {
    let fingerprint = self.fingerprint(store)?;
    self.sigs.insert(key.sign_detached(&fingerprint));
    Ok(())
  }

  /// Rebuild the full content address from the mini form plus the stored
  /// references.
  pub fn full_content_address(&self) -> Result<Option<ContentAddressWithRefs>> {
    let ca = match self.ca {
      Some(ca) => ca,
      None => return Ok(None),
    };
    let info = match ca {
      ContentAddress::Text(t) => {
        ensure!(
          !self.refs.has_self_reference,
          "text path `{}' may not refer to itself",
          self.path
        );
        CaInfo::Text(TextInfo {
          hash: t.0,
          references: self.refs.references.clone(),
        })
      }
      ContentAddress::Fixed(f) => CaInfo::Fixed(FixedOutputInfo {
        method: f.method,
        hash: f.hash,
        references: self.refs.clone(),
      }),
      ContentAddress::Ipfs(i) => CaInfo::Ipfs(IpfsInfo {
        hash: i,
        references: PathReferences {
          references: Default::default(),
          has_self_reference: self.refs.has_self_reference,
        },
      }),
    };
    Ok(Some(ContentAddressWithRefs {
      name: self.path.name().to_string(),
      info,
    }))
  }

  /// Whether the path's name is honestly derived from its declared content
  /// address.
  pub fn is_content_addressed<S: Store + ?Sized>(&self, store: &S) -> Result<bool> {
    let full = match self.full_content_address()? {
      Some(full) => full,
      None => return Ok(false),
    };
    let expected = store.make_fixed_output_path_from_ca(&full)?;
    if expected != self.path {
      slog_scope::warn!(
        "path `{}' claims to be content-addressed but isn't",
        store.print_store_path(&self.path)
      );
      return Ok(false);
    }
    Ok(true)
  }

  /// Count signatures valid under `keys`. Verifiably content-addressed
  /// paths satisfy any requirement and report [`MAX_SIGS`].
  pub fn check_signatures<S: Store + ?Sized>(
    &self,
    store: &S,
    keys: &PublicKeys,
  ) -> Result<usize> {
    if self.is_content_addressed(store)? {
      return Ok(MAX_SIGS);
    }
    let fingerprint = self.fingerprint(store)?;
    Ok(
      self
        .sigs
        .iter()
        .filter(|sig| verify_detached(&fingerprint, sig, keys))
        .count(),
    )
  }

  pub fn check_signature<S: Store + ?Sized>(
    &self,
    store: &S,
    keys: &PublicKeys,
    sig: &str,
  ) -> Result<bool> {
    Ok(verify_detached(&self.fingerprint(store)?, sig, keys))
  }
}

impl PartialEq for ValidPathInfo {
  fn eq(&self, other: &Self) -> bool {
    self.path == other.path && self.nar_hash == other.nar_hash && self.refs == other.refs
  }
}

impl Eq for ValidPathInfo {}

impl std::hash::Hash for ValidPathInfo {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.path.hash(state);
    self.nar_hash.hash(state);
  }
}
