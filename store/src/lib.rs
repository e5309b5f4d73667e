#[macro_use] extern crate derive_more;
#[macro_use] extern crate enum_as_inner;
#[macro_use] extern crate lazy_static;

use crate::cache::DiskCacheOutcome;
use crate::derivation::DRV_HASHES;
use crate::prelude::*;
use cask_util::error::is_invalid_path;
use parking_lot::{Condvar, Mutex};
use slog_scope::warn;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod cache;
pub mod content_address;
pub mod copy;
pub mod daemon;
pub mod derivation;
pub mod local;
pub mod path;
pub mod path_info;
mod prelude;
pub mod serve;
pub mod settings;
pub mod signing;
#[cfg(test)] pub(crate) mod test;
pub mod uri;
pub mod wire;

pub use cache::{DiskCache, PathInfoCache};
pub use content_address::{ContentAddress, ContentAddressWithRefs, FileIngestionMethod};
pub use copy::{copy_closure, copy_paths, copy_store_path};
pub use derivation::{Derivation, DerivationType, HashModulo, Output};
pub use local::LocalStore;
pub use path::StorePath;
pub use path_info::ValidPathInfo;
pub use prelude::{CheckSigs, Repair, Substitute};
pub use settings::Settings;
pub use uri::{default_substituters, open_store};

pub type PathSet = BTreeSet<String>;
pub type StorePathSet = BTreeSet<StorePath>;

#[derive(Copy, Clone, Default)]
pub struct ClosureOpts {
  pub backwards: bool,
  pub include_outputs: bool,
  pub include_derivers: bool,
}

/// The terminal continuation of an asynchronous query. Invoked exactly
/// once, possibly on another thread; errors cross the boundary through it
/// rather than by unwinding.
pub struct Callback<'a, T> {
  f: Box<dyn FnOnce(Result<T>) + Send + 'a>,
}

impl<'a, T> Callback<'a, T> {
  pub fn new(f: impl FnOnce(Result<T>) + Send + 'a) -> Self {
    Self { f: Box::new(f) }
  }

  pub fn call(self, res: Result<T>) {
    (self.f)(res)
  }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BuildMode {
  Build,
  Repair,
  Check,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BuildStatus {
  Built,
  Substituted,
  AlreadyValid,
  PermanentFailure,
  InputRejected,
  OutputRejected,
  TransientFailure,
  CachedFailure,
  TimedOut,
  MiscFailure,
  DependencyFailed,
  LogLimitExceeded,
  NotDeterministic,
}

impl BuildStatus {
  pub fn from_wire(n: u64) -> Result<Self> {
    use BuildStatus::*;
    Ok(match n {
      0 => Built,
      1 => Substituted,
      2 => AlreadyValid,
      3 => PermanentFailure,
      4 => InputRejected,
      5 => OutputRejected,
      6 => TransientFailure,
      7 => CachedFailure,
      8 => TimedOut,
      9 => MiscFailure,
      10 => DependencyFailed,
      11 => LogLimitExceeded,
      12 => NotDeterministic,
      x => bail!("unknown build status {}", x),
    })
  }
}

#[derive(Clone, Debug)]
pub struct BuildResult {
  pub status: BuildStatus,
  pub error_msg: String,
  pub times_built: u64,
  pub is_non_deterministic: bool,
  pub start_time: u64,
  pub stop_time: u64,
}

impl BuildResult {
  pub fn success(&self) -> bool {
    matches!(
      self.status,
      BuildStatus::Built | BuildStatus::Substituted | BuildStatus::AlreadyValid
    )
  }
}

pub trait Store: Send + Sync {
  fn store_dir(&self) -> &Path;

  /// A human-readable identifier for this store, also the key into the
  /// shared disk cache.
  fn uri(&self) -> String;

  fn info_cache(&self) -> &PathInfoCache;

  fn parse_store_path(&self, path: &Path) -> Result<StorePath> {
    if path.parent() != Some(self.store_dir()) {
      return Err(NotInStore(path.display().to_string()).into());
    }

    StorePath::from_base_name(
      path
        .file_name()
        .and_then(|x| x.to_str())
        .ok_or_else(|| anyhow!("invalid filepath"))?,
    )
  }

  fn print_store_path(&self, path: &StorePath) -> String {
    self.to_real_path(path).display().to_string()
  }

  fn to_real_path(&self, path: &StorePath) -> PathBuf {
    self.store_dir().join(path.to_string())
  }

  fn is_in_store(&self, path: &Path) -> bool {
    path.starts_with(self.store_dir())
  }

  /// Resolve symlinks until the result lands in the store, then cut the
  /// path down to the store object containing it.
  fn follow_links_to_store(&self, path: &Path) -> Result<PathBuf> {
    let mut path = path.to_path_buf();
    while !self.is_in_store(&path) {
      let meta = std::fs::symlink_metadata(&path)?;
      if !meta.file_type().is_symlink() {
        break;
      }
      let target = std::fs::read_link(&path)?;
      path = if target.is_absolute() {
        target
      } else {
        path.parent().unwrap_or(Path::new("/")).join(target)
      };
    }
    if !self.is_in_store(&path) {
      return Err(NotInStore(path.display().to_string()).into());
    }
    Ok(path)
  }

  fn follow_links_to_store_path(&self, path: &Path) -> Result<StorePath> {
    let resolved = self.follow_links_to_store(path)?;
    let relative = resolved.strip_prefix(self.store_dir())?;
    let base = relative
      .components()
      .next()
      .ok_or_else(|| NotInStore(resolved.display().to_string()))?;
    self.parse_store_path(&self.store_dir().join(base))
  }

  // -- store path construction ------------------------------------------

  fn make_store_path(&self, path_type: &str, hash: Hash, name: &str) -> Result<StorePath> {
    let ident = format!(
      "{}:{}:{}:{}",
      path_type,
      hash.encode_with_type(Encoding::Base16),
      self.store_dir().display(),
      name
    );
    let full_hash = Hash::hash(&ident, HashType::SHA256);
    let hash = full_hash.truncate(20);
    StorePath::from_parts(hash.as_bytes(), name)
  }

  fn make_output_path(&self, id: &str, hash: Hash, name: &str) -> Result<StorePath> {
    if id == "out" {
      self.make_store_path(&format!("output:{}", id), hash, name)
    } else {
      self.make_store_path(&format!("output:{}", id), hash, &format!("{}-{}", name, id))
    }
  }

  fn make_text_path(&self, name: &str, hash: Hash, refs: &StorePathSet) -> Result<StorePath> {
    ensure!(
      hash.ty() == HashType::SHA256,
      "make_text_path can only be used with SHA-256"
    );
    self.make_store_path(&make_type(self, "text".into(), refs, false), hash, name)
  }

  fn make_fixed_output_path(
    &self,
    method: FileIngestionMethod,
    hash: Hash,
    name: &str,
    refs: &StorePathSet,
    self_referential: bool,
  ) -> Result<StorePath> {
    ensure!(
      method != FileIngestionMethod::Git || hash.ty() == HashType::SHA1,
      "Git file ingestion must use sha1 hash"
    );

    if hash.ty() == HashType::SHA256 && method == FileIngestionMethod::Recursive {
      self.make_store_path(
        &make_type(self, "source".into(), refs, self_referential),
        hash,
        name,
      )
    } else {
      ensure!(
        refs.is_empty() && !self_referential,
        "fixed-output paths with references may only be recursive SHA-256"
      );
      self.make_store_path(
        "output:out",
        Hash::hash(
          format!(
            "fixed:out:{}{}:",
            method.prefix(),
            hash.encode_with_type(Encoding::Base16)
          ),
          HashType::SHA256,
        ),
        name,
      )
    }
  }

  fn make_ipfs_path(&self, name: &str, hash: &content_address::IpfsHash) -> Result<StorePath> {
    ensure!(
      hash.0.ty() == HashType::SHA256,
      "ipfs paths must use SHA-256"
    );
    // same shape as make_store_path, but the inner key is the CID
    let ident = format!(
      "ipfs:{}:{}:{}",
      hash.cid(),
      self.store_dir().display(),
      name
    );
    let full_hash = Hash::hash(&ident, HashType::SHA256);
    let compressed = full_hash.truncate(20);
    StorePath::from_parts(compressed.as_bytes(), name)
  }

  fn make_fixed_output_path_from_ca(&self, ca: &ContentAddressWithRefs) -> Result<StorePath> {
    match &ca.info {
      CaInfo::Text(t) => self.make_text_path(&ca.name, t.hash, &t.references),
      CaInfo::Fixed(f) => self.make_fixed_output_path(
        f.method,
        f.hash,
        &ca.name,
        &f.references.references,
        f.references.has_self_reference,
      ),
      CaInfo::Ipfs(i) => self.make_ipfs_path(&ca.name, &i.hash),
    }
  }

  fn store_path_for_text(
    &self,
    name: &str,
    contents: &[u8],
    refs: &StorePathSet,
  ) -> Result<StorePath> {
    self.make_text_path(name, Hash::hash(contents, HashType::SHA256), refs)
  }

  /// Predict where ingesting a filesystem path would land, without
  /// touching the store. Also returns the content hash it was named by.
  fn compute_store_path_for_path(
    &self,
    name: &str,
    path: &Path,
    method: FileIngestionMethod,
    hash_type: HashType,
    filter: &PathFilter,
  ) -> Result<(StorePath, Hash)> {
    let hash = match method {
      FileIngestionMethod::Recursive => {
        let mut sink = HashSink::new(hash_type, std::io::sink());
        nar::dump_path(path, &mut sink, filter)?;
        sink.finish().1
      }
      FileIngestionMethod::Flat => Hash::hash_file(path, hash_type)?.0,
      FileIngestionMethod::Git => {
        return Err(unsupported("computeStorePathForPath with git ingestion"))
      }
    };
    let store_path =
      self.make_fixed_output_path(method, hash, name, &Default::default(), false)?;
    Ok((store_path, hash))
  }

  // -- derivations ------------------------------------------------------

  /// Parse a derivation that is known to be valid in this store.
  fn read_derivation(&self, _path: &StorePath) -> Result<Derivation> {
    Err(unsupported("readDerivation"))
  }

  /// Like `read_derivation`, but accepts a path not registered yet.
  fn try_read_derivation(&self, path: &StorePath) -> Result<Derivation> {
    self.read_derivation(path)
  }

  fn write_derivation(
    &self,
    derivation: &Derivation,
    repair: Repair,
    read_only: bool,
  ) -> Result<StorePath> {
    // the outputs are not references; they may not exist yet
    let mut refs = derivation.input_sources.clone();
    refs.extend(derivation.input_derivations.keys().cloned());

    let suffix = format!("{}{}", derivation.name, path::DRV_EXTENSION);
    let contents = derivation.print(self, false, None).to_string();

    if read_only || Settings::get().read_only_mode() {
      self.store_path_for_text(&suffix, contents.as_bytes(), &refs)
    } else {
      self.add_text_to_store(&suffix, contents.as_bytes(), &refs, Repair::Off)
    }
  }

  /// The equivalence-class hash of a derivation: fixed-output derivations
  /// are fingerprinted per output by their declared content hash;
  /// everything else hashes the masked text with upstream derivation
  /// paths replaced by their own modulo hashes. Fixed upstreams collapse
  /// to anonymous single-output entries so the result does not encode
  /// which derivation produced the bytes.
  fn hash_derivation_modulo(
    &self,
    derivation: &Derivation,
    mask_outputs: bool,
  ) -> Result<HashModulo> {
    match derivation.ty()? {
      DerivationType::Fixed => {
        let mut output_hashes = HashMap::new();
        for (name, output) in &derivation.outputs {
          let fixed = output
            .as_fixed()
            .ok_or_else(|| anyhow!("fixed-output derivations must only have fixed outputs"))?;
          let path = derivation::fixed_output_path(self, *fixed, &derivation.name, name)?;
          let hash = Hash::hash(
            format!(
              "fixed:out:{}:{}:{}",
              fixed.method_algo(),
              fixed.hash.encode(Encoding::Base16),
              self.print_store_path(&path)
            ),
            HashType::SHA256,
          );
          output_hashes.insert(name.clone(), hash);
        }
        return Ok(HashModulo::FixedOutput(output_hashes));
      }
      DerivationType::Floating => bail!("Floating CA derivations are unimplemented"),
      DerivationType::InputAddressed => {}
    }

    let mut inputs2 = BTreeMap::new();
    for (path, outputs) in &derivation.input_derivations {
      match self.path_derivation_modulo(path)? {
        HashModulo::Normal(h) => {
          inputs2.insert(h.encode(Encoding::Base16), outputs.clone());
        }
        HashModulo::FixedOutput(hashes) => {
          for out in outputs {
            let h = hashes
              .get(out)
              .ok_or_else(|| anyhow!("hash missing for output `{}'", out))?;
            inputs2.insert(
              h.encode(Encoding::Base16),
              std::iter::once("out".to_string()).collect(),
            );
          }
        }
      }
    }

    Ok(HashModulo::Normal(Hash::hash(
      derivation
        .print(self, mask_outputs, Some(inputs2))
        .to_string(),
      HashType::SHA256,
    )))
  }

  /// Memoised companion of `hash_derivation_modulo`, keyed by the
  /// derivation's store path for the life of the process.
  fn path_derivation_modulo(&self, drv_path: &StorePath) -> Result<HashModulo> {
    if let Some(known) = DRV_HASHES.lock().get(drv_path).cloned() {
      return Ok(known);
    }

    let drv = self.try_read_derivation(drv_path)?;
    let hash = self.hash_derivation_modulo(&drv, false)?;

    DRV_HASHES.lock().insert(drv_path.clone(), hash.clone());

    Ok(hash)
  }

  // -- validity and path info -------------------------------------------

  fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
    let hash_part = path.hash_part();

    if let Some(entry) = self.info_cache().lookup(&hash_part) {
      return Ok(entry.did_exist());
    }

    if let Some(disk) = self.info_cache().disk() {
      match disk.lookup(self, &self.uri(), &hash_part)? {
        DiskCacheOutcome::Unknown => {}
        DiskCacheOutcome::Invalid => {
          self.info_cache().upsert(hash_part, None);
          return Ok(false);
        }
        DiskCacheOutcome::Valid(info) => {
          self.info_cache().upsert(hash_part, Some(Arc::new(info)));
          return Ok(true);
        }
      }
    }

    let valid = self.is_valid_path_uncached(path)?;

    if !valid {
      // the backend itself said so, which the disk cache may remember
      if let Some(disk) = self.info_cache().disk() {
        disk.upsert(self, &self.uri(), &hash_part, None)?;
      }
      self.info_cache().upsert(hash_part, None);
    }

    Ok(valid)
  }

  fn is_valid_path_uncached(&self, path: &StorePath) -> Result<bool> {
    match self.get_path_info(path) {
      Ok(_) => Ok(true),
      Err(e) if is_invalid_path(&e) => Ok(false),
      Err(e) => Err(e),
    }
  }

  /// The cached query pipeline: in-memory cache, then disk cache, then
  /// the backend. May complete synchronously on a hit; the callback fires
  /// exactly once either way.
  fn query_path_info<'s>(&'s self, path: &StorePath, callback: Callback<'s, Arc<ValidPathInfo>>) {
    let hash_part = path.hash_part();

    if let Some(entry) = self.info_cache().lookup(&hash_part) {
      return match entry.value {
        Some(info) => callback.call(Ok(info)),
        None => callback.call(Err(InvalidPath(self.print_store_path(path)).into())),
      };
    }

    if let Some(disk) = self.info_cache().disk() {
      match disk.lookup(self, &self.uri(), &hash_part) {
        Err(e) => return callback.call(Err(e)),
        Ok(DiskCacheOutcome::Unknown) => {}
        Ok(DiskCacheOutcome::Invalid) => {
          self.info_cache().upsert(hash_part, None);
          return callback.call(Err(InvalidPath(self.print_store_path(path)).into()));
        }
        Ok(DiskCacheOutcome::Valid(info)) => {
          let info = Arc::new(info);
          self
            .info_cache()
            .upsert(hash_part, Some(Arc::clone(&info)));
          // a cache answer for some other path means ours is not valid
          if info.path != *path {
            return callback.call(Err(InvalidPath(self.print_store_path(path)).into()));
          }
          return callback.call(Ok(info));
        }
      }
    }

    let queried = path.clone();
    self.query_path_info_uncached(
      path,
      Callback::new(move |res| match res {
        Ok(Some(info)) => {
          let info = Arc::new(info);
          if let Some(disk) = self.info_cache().disk() {
            if let Err(e) = disk.upsert(self, &self.uri(), &hash_part, Some(&info)) {
              warn!("failed to update the narinfo disk cache: {:#}", e);
            }
          }
          self
            .info_cache()
            .upsert(hash_part, Some(Arc::clone(&info)));
          if info.path != queried {
            self.info_cache().record_missing();
            return callback.call(Err(InvalidPath(self.print_store_path(&queried)).into()));
          }
          callback.call(Ok(info))
        }
        Ok(None) => {
          // negative answers only poison the in-memory cache; the backend
          // did not explicitly invalidate the path
          self.info_cache().record_missing();
          self.info_cache().upsert(hash_part, None);
          callback.call(Err(InvalidPath(self.print_store_path(&queried)).into()))
        }
        Err(e) => callback.call(Err(e)),
      }),
    );
  }

  /// Blocking wrapper over `query_path_info`.
  fn get_path_info(&self, path: &StorePath) -> Result<Arc<ValidPathInfo>> {
    let (tx, rx) = crossbeam::channel::bounded(1);
    self.query_path_info(
      path,
      Callback::new(move |res| {
        let _ = tx.send(res);
      }),
    );
    rx.recv()
      .map_err(|_| anyhow!("path info query dropped its callback"))?
  }

  /// Ask the backend about one path. Must invoke `callback` exactly once,
  /// with `Ok(None)` when the path simply is not there.
  fn query_path_info_uncached<'s>(
    &'s self,
    path: &StorePath,
    callback: Callback<'s, Option<ValidPathInfo>>,
  );

  /// Bulk validity: fan the queries out over a pool of workers,
  /// accumulating the valid subset and the first hard error.
  fn query_valid_paths(
    &self,
    paths: &StorePathSet,
    _maybe_substitute: Substitute,
  ) -> Result<StorePathSet> {
    struct State {
      left: usize,
      valid: StorePathSet,
      exc: Option<anyhow::Error>,
    }

    if paths.is_empty() {
      return Ok(StorePathSet::new());
    }

    let state = Mutex::new(State {
      left: paths.len(),
      valid: StorePathSet::new(),
      exc: None,
    });
    let wakeup = Condvar::new();
    let work = Mutex::new(paths.iter().cloned().collect::<Vec<_>>());

    let workers = std::thread::available_parallelism()
      .map(|n| n.get())
      .unwrap_or(1)
      .min(paths.len());

    crossbeam::scope(|scope| {
      for _ in 0..workers {
        scope.spawn(|_| loop {
          let path = match work.lock().pop() {
            Some(p) => p,
            None => break,
          };

          let settle = |res: Result<()>| {
            let mut st = state.lock();
            if let Err(e) = res {
              if !is_invalid_path(&e) && st.exc.is_none() {
                st.exc = Some(e);
              }
            }
            st.left -= 1;
            if st.left == 0 {
              wakeup.notify_one();
            }
          };

          if let Err(e) = check_interrupt() {
            settle(Err(e));
            continue;
          }

          let queried = path.clone();
          self.query_path_info(
            &path,
            Callback::new(|res| match res {
              Ok(_) => {
                let mut st = state.lock();
                st.valid.insert(queried);
                st.left -= 1;
                if st.left == 0 {
                  wakeup.notify_one();
                }
              }
              Err(e) => settle(Err(e)),
            }),
          );
        });
      }
    })
    .unwrap();

    let mut st = state.lock();
    while st.left > 0 {
      wakeup.wait(&mut st);
    }
    if let Some(e) = st.exc.take() {
      return Err(e);
    }
    Ok(std::mem::take(&mut st.valid))
  }

  fn query_path_from_hash_part(&self, _hash_part: &str) -> Result<Option<StorePath>> {
    Err(unsupported("queryPathFromHashPart"))
  }

  // -- content movement -------------------------------------------------

  /// Import a path whose archive bytes come from `source`; `info`
  /// describes what the bytes must hash to.
  fn add_to_store(
    &self,
    _info: &ValidPathInfo,
    _source: &mut dyn Read,
    _repair: Repair,
    _check_sigs: CheckSigs,
  ) -> Result<()> {
    Err(unsupported("addToStore"))
  }

  fn add_text_to_store(
    &self,
    _name: &str,
    _contents: &[u8],
    _refs: &StorePathSet,
    _repair: Repair,
  ) -> Result<StorePath> {
    Err(unsupported("addTextToStore"))
  }

  fn add_path_to_store(
    &self,
    _name: &str,
    _path: &Path,
    _method: FileIngestionMethod,
    _hash_type: HashType,
    _filter: &PathFilter,
    _repair: Repair,
  ) -> Result<StorePath> {
    Err(unsupported("addPathToStore"))
  }

  fn add_dump_to_store(
    &self,
    _source: &mut dyn Read,
    _name: &str,
    _method: FileIngestionMethod,
    _hash_type: HashType,
    _repair: Repair,
  ) -> Result<StorePath> {
    Err(unsupported("addDumpToStore"))
  }

  /// Write the path's archive serialisation to `sink`.
  fn nar_from_path(&self, _path: &StorePath, _sink: &mut dyn Write) -> Result<()> {
    Err(unsupported("narFromPath"))
  }

  fn ensure_path(&self, path: &StorePath) -> Result<()> {
    if self.is_valid_path(path)? {
      Ok(())
    } else {
      Err(InvalidPath(self.print_store_path(path)).into())
    }
  }

  // -- building ---------------------------------------------------------

  fn build_derivation(
    &self,
    _drv_path: &StorePath,
    _drv: &Derivation,
    _mode: BuildMode,
  ) -> Result<BuildResult> {
    Err(unsupported("buildDerivation"))
  }

  // -- closures ---------------------------------------------------------

  fn compute_fs_closure(
    &self,
    paths: &StorePathSet,
    out: &mut StorePathSet,
    opts: ClosureOpts,
  ) -> Result<()> {
    closure_via_queries(self, paths, out, opts)
  }

  // -- connection management --------------------------------------------

  fn connect(&self) -> Result<()> {
    Ok(())
  }

  fn get_protocol(&self) -> Result<u64> {
    Err(unsupported("getProtocol"))
  }

  // -- miscellany -------------------------------------------------------

  fn show_paths(&self, paths: &StorePathSet) -> String {
    paths
      .iter()
      .map(|p| format!("`{}'", self.print_store_path(p)))
      .collect::<Vec<_>>()
      .join(", ")
  }

  /// The text block `decode_valid_path_info` reads back; one stanza per
  /// path.
  fn make_validity_registration(
    &self,
    paths: &StorePathSet,
    show_derivers: bool,
    show_hash: bool,
  ) -> Result<String> {
    let mut s = String::new();

    for path in paths {
      s += &self.print_store_path(path);
      s.push('\n');

      let info = self.get_path_info(path)?;

      if show_hash {
        let hash = info
          .nar_hash
          .ok_or_else(|| anyhow!("path `{}' has no hash", self.print_store_path(path)))?;
        s += &hash.encode(Encoding::Base16);
        s.push('\n');
        s += &info.nar_size.unwrap_or(0).to_string();
        s.push('\n');
      }

      match (&info.deriver, show_derivers) {
        (Some(deriver), true) => s += &self.print_store_path(deriver),
        _ => {}
      }
      s.push('\n');

      let refs = info.references_possibly_to_self();
      s += &refs.len().to_string();
      s.push('\n');
      for r in &refs {
        s += &self.print_store_path(r);
        s.push('\n');
      }
    }

    Ok(s)
  }
}

/// Stuff the references into the type tag; they cannot go into the inner
/// string without becoming ambiguous.
fn make_type<S: Store + ?Sized>(
  store: &S,
  mut ty: String,
  refs: &StorePathSet,
  self_referential: bool,
) -> String {
  for r in refs {
    ty.push(':');
    ty.push_str(&store.print_store_path(r));
  }
  if self_referential {
    ty.push_str(":self");
  }
  ty
}

/// Forward closure by repeated path-info queries; shared by the trait
/// default and by backends that only accelerate the plain case.
pub fn closure_via_queries<S: Store + ?Sized>(
  store: &S,
  paths: &StorePathSet,
  out: &mut StorePathSet,
  opts: ClosureOpts,
) -> Result<()> {
  if opts.backwards {
    return Err(unsupported("computeFSClosure backwards"));
  }

  fn visit<S: Store + ?Sized>(
    store: &S,
    path: &StorePath,
    out: &mut StorePathSet,
    opts: ClosureOpts,
  ) -> Result<()> {
    check_interrupt()?;
    if !out.insert(path.clone()) {
      return Ok(());
    }

    let info = store.get_path_info(path)?;

    for r in &info.refs.references {
      visit(store, r, out, opts)?;
    }

    if opts.include_outputs && path.is_derivation() {
      for (_, (_, out_path)) in store
        .try_read_derivation(path)?
        .outputs_and_opt_paths(store)?
      {
        if let Some(out_path) = out_path {
          if store.is_valid_path(&out_path)? {
            visit(store, &out_path, out, opts)?;
          }
        }
      }
    }

    if opts.include_derivers {
      if let Some(deriver) = &info.deriver {
        if store.is_valid_path(deriver)? {
          visit(store, deriver, out, opts)?;
        }
      }
    }

    Ok(())
  }

  for path in paths {
    visit(store, path, out, opts)?;
  }
  Ok(())
}

/// Inverse of `make_validity_registration`: read one stanza, or `None` at
/// end of input.
pub fn decode_valid_path_info<S: Store + ?Sized>(
  store: &S,
  reader: &mut dyn BufRead,
  hash_given: bool,
) -> Result<Option<ValidPathInfo>> {
  let mut line = String::new();
  if reader.read_line(&mut line)? == 0 {
    return Ok(None);
  }
  let path = store.parse_store_path(Path::new(line.trim_end_matches('\n')))?;

  let mut next_line = |what: &str| -> Result<String> {
    let mut line = String::new();
    ensure!(reader.read_line(&mut line)? > 0, "missing {}", what);
    line.truncate(line.trim_end_matches('\n').len());
    Ok(line)
  };

  let mut info = ValidPathInfo {
    path,
    deriver: None,
    nar_hash: None,
    nar_size: None,
    refs: Default::default(),
    registration_time: None,
    ultimate: false,
    sigs: Default::default(),
    ca: None,
  };

  if hash_given {
    info.nar_hash = Some(Hash::decode_with_type(
      &next_line("hash")?,
      HashType::SHA256,
      false,
    )?);
    info.nar_size = Some(
      next_line("size")?
        .parse::<u64>()
        .map_err(|_| anyhow!("number expected"))?,
    );
  }

  let deriver = next_line("deriver")?;
  if !deriver.is_empty() {
    info.deriver = Some(store.parse_store_path(Path::new(&deriver))?);
  }

  let count = next_line("reference count")?
    .parse::<usize>()
    .map_err(|_| anyhow!("number expected"))?;
  for _ in 0..count {
    let r = store.parse_store_path(Path::new(&next_line("reference")?))?;
    info.insert_reference_possibly_to_self(r);
  }

  Ok(Some(info))
}
