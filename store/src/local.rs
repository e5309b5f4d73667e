//! The local filesystem backend: store objects are plain files and
//! directories under the store dir, archives are streamed straight off
//! disk. Registration metadata lives in memory for the life of the
//! handle; bookkeeping beyond that is someone else's job.

use crate::cache::PathInfoCache;
use crate::prelude::*;
use crate::{BuildMode, BuildResult, Callback, PathSet, Settings, Store};
use parking_lot::Mutex;
use slog_scope::{debug, info};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub struct LocalStore {
  root: Option<PathBuf>,
  store: PathBuf,
  state_dir: PathBuf,
  log_dir: PathBuf,
  cache: PathInfoCache,
  /// Path metadata registered through this handle. Queries for anything
  /// else fall back to what the filesystem can prove.
  infos: Mutex<HashMap<StorePath, ValidPathInfo>>,
}

const KNOWN_PARAMS: &[&str] = &["root", "store", "state", "log"];

impl LocalStore {
  pub fn open(params: &crate::uri::StoreParams) -> Result<Self> {
    crate::uri::warn_unknown_params(params, KNOWN_PARAMS);

    let settings = Settings::get();
    let root = params.get("root").map(PathBuf::from);

    let under_root = |dir: &Path| match &root {
      Some(root) => root.append(dir),
      None => dir.to_path_buf(),
    };

    let store = match params.get("store") {
      Some(dir) => PathBuf::from(dir),
      None => under_root(settings.store_dir()),
    };
    let state_dir = match params.get("state") {
      Some(dir) => PathBuf::from(dir),
      None => under_root(settings.state_dir()),
    };
    let log_dir = match params.get("log") {
      Some(dir) => PathBuf::from(dir),
      None => under_root(settings.log_dir()),
    };

    std::fs::create_dir_all(&store)?;

    Ok(Self {
      root,
      store,
      state_dir,
      log_dir,
      cache: PathInfoCache::new(),
      infos: Default::default(),
    })
  }

  pub fn state_dir(&self) -> &Path {
    &self.state_dir
  }

  pub fn log_file_of(&self, path: &StorePath) -> PathBuf {
    let base = path.to_string();
    self.log_dir.join("drvs").join(&base[..2]).join(&base[2..])
  }

  pub fn accessor(&self) -> FsAccessor<'_> {
    FsAccessor { store: self }
  }

  pub fn register_valid_path(&self, info: ValidPathInfo) {
    debug!("registering path"; "path" => %info.path);
    self.infos.lock().insert(info.path.clone(), info);
  }

  pub fn register_valid_paths(&self, infos: Vec<ValidPathInfo>) {
    for info in infos {
      self.register_valid_path(info);
    }
  }

  fn hash_sink_for(&self, info: &ValidPathInfo) -> HashEither {
    if info.ca.is_some() && info.refs.has_self_reference {
      HashEither::Modulo(HashModuloSink::new(
        HashType::SHA256,
        &info.path.hash_part(),
      ))
    } else {
      HashEither::Plain(HashSink::new(HashType::SHA256, std::io::sink()))
    }
  }
}

enum HashEither {
  Plain(HashSink<std::io::Sink>),
  Modulo(HashModuloSink),
}

impl HashEither {
  fn finish(self) -> (Hash, u64) {
    match self {
      Self::Plain(sink) => {
        let (_, hash, len) = sink.finish();
        (hash, len)
      }
      Self::Modulo(sink) => sink.finish(),
    }
  }
}

impl Write for HashEither {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    match self {
      Self::Plain(sink) => sink.write(buf),
      Self::Modulo(sink) => sink.write(buf),
    }
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

impl Store for LocalStore {
  fn store_dir(&self) -> &Path {
    &self.store
  }

  fn uri(&self) -> String {
    match &self.root {
      Some(root) => format!("local?root={}", root.display()),
      None => "local".into(),
    }
  }

  fn info_cache(&self) -> &PathInfoCache {
    &self.cache
  }

  fn is_valid_path_uncached(&self, path: &StorePath) -> Result<bool> {
    Ok(self.to_real_path(path).exists())
  }

  fn query_path_info_uncached<'s>(
    &'s self,
    path: &StorePath,
    callback: Callback<'s, Option<ValidPathInfo>>,
  ) {
    let compute = || -> Result<Option<ValidPathInfo>> {
      if let Some(info) = self.infos.lock().get(path) {
        return Ok(Some(info.clone()));
      }

      let real_path = self.to_real_path(path);
      if !real_path.exists() {
        return Ok(None);
      }

      // unregistered but present: recover what the filesystem knows
      let mut sink = HashSink::new(HashType::SHA256, std::io::sink());
      nar::dump_path(&real_path, &mut sink, &PathFilter::none())?;
      let (_, nar_hash, nar_size) = sink.finish();

      let mut info = ValidPathInfo::new(path.clone(), nar_hash);
      info.nar_size = Some(nar_size);
      info.registration_time = std::fs::symlink_metadata(&real_path)
        .and_then(|m| m.modified())
        .ok();
      Ok(Some(info))
    };

    callback.call(compute())
  }

  fn query_path_from_hash_part(&self, hash_part: &str) -> Result<Option<StorePath>> {
    for entry in std::fs::read_dir(&self.store)? {
      let entry = entry?;
      if let Some(name) = entry.file_name().to_str() {
        if name.starts_with(hash_part) {
          return Ok(Some(StorePath::from_base_name(name)?));
        }
      }
    }
    Ok(None)
  }

  fn read_derivation(&self, path: &StorePath) -> Result<Derivation> {
    let contents = std::fs::read_to_string(self.to_real_path(path))?;
    Derivation::parse(self, path.derivation_name()?.to_string(), contents)
  }

  fn nar_from_path(&self, path: &StorePath, sink: &mut dyn Write) -> Result<()> {
    if !self.is_valid_path(path)? {
      return Err(InvalidPath(self.print_store_path(path)).into());
    }
    nar::dump_path(self.to_real_path(path), sink, &PathFilter::none())
  }

  fn add_to_store(
    &self,
    info: &ValidPathInfo,
    source: &mut dyn Read,
    repair: Repair,
    _check_sigs: CheckSigs,
  ) -> Result<()> {
    if self.is_valid_path(&info.path)? && repair == Repair::Off {
      return Ok(());
    }

    let real_path = self.to_real_path(&info.path);
    rm_rf::ensure_removed(&real_path)?;

    let mut nar_hasher = self.hash_sink_for(info);
    let tee = tee_readwrite::TeeReader::new(source, &mut nar_hasher, false);

    nar::restore_path(&real_path, tee)?;

    let (actual_hash, actual_size) = nar_hasher.finish();

    if let Some(expected) = info.nar_hash {
      if actual_hash != expected {
        bail!(
          "hash mismatch while importing path `{}';\n  specified: {}\n  got:       {}",
          real_path.display(),
          expected.encode_with_type(Encoding::Base32),
          actual_hash.encode_with_type(Encoding::Base32)
        );
      }
    }

    if let Some(expected) = info.nar_size {
      if actual_size != expected {
        bail!(
          "size mismatch while importing path `{}';\n  specified: {}\n  got:       {}",
          real_path.display(),
          expected,
          actual_size
        );
      }
    }

    self.register_valid_path(info.clone());
    self.info_cache().upsert(
      info.path.hash_part(),
      Some(std::sync::Arc::new(info.clone())),
    );

    Ok(())
  }

  fn add_text_to_store(
    &self,
    name: &str,
    contents: &[u8],
    refs: &StorePathSet,
    _repair: Repair,
  ) -> Result<StorePath> {
    let hash = Hash::hash(contents, HashType::SHA256);
    let dest_path = self.make_text_path(name, hash, refs)?;

    let real_path = self.to_real_path(&dest_path);

    info!("writing contents to store path {}", real_path.display());
    std::fs::write(&real_path, contents)?;

    let mut nar_sink = HashSink::new(HashType::SHA256, std::io::sink());
    nar::dump_path(&real_path, &mut nar_sink, &PathFilter::none())?;
    let (_, nar_hash, nar_size) = nar_sink.finish();

    let mut path_info = ValidPathInfo::new(dest_path.clone(), nar_hash);
    path_info.nar_size = Some(nar_size);
    path_info.refs.references = refs.clone();
    path_info.registration_time = Some(SystemTime::now());
    path_info.ultimate = true;
    path_info.ca = Some(ContentAddress::Text(TextHash(hash)));
    self.register_valid_path(path_info);

    Ok(dest_path)
  }

  fn add_path_to_store(
    &self,
    name: &str,
    path: &Path,
    method: FileIngestionMethod,
    hash_type: HashType,
    filter: &PathFilter,
    repair: Repair,
  ) -> Result<StorePath> {
    crossbeam::scope(|s| {
      let (mut read_side, mut write_side) = pipe()?;

      let handle = s.spawn::<_, Result<()>>(move |_| {
        if method == FileIngestionMethod::Recursive {
          nar::dump_path(path, write_side, filter)?;
        } else {
          let mut file = File::open(path)?;
          std::io::copy(&mut file, &mut write_side)?;
        }
        Ok(())
      });

      let store_path =
        self.add_dump_to_store(&mut read_side, name, method, hash_type, repair)?;
      handle.join().unwrap()?;
      Ok(store_path)
    })
    .unwrap()
  }

  fn add_dump_to_store(
    &self,
    source: &mut dyn Read,
    name: &str,
    method: FileIngestionMethod,
    hash_type: HashType,
    _repair: Repair,
  ) -> Result<StorePath> {
    let mut hash_sink = HashSink::new(hash_type, std::io::sink());
    let mut hashing_source = tee_readwrite::TeeReader::new(source, &mut hash_sink, false);

    let dump_root = tempfile::tempdir()?;
    let dump_to = dump_root.path().join("x");

    if method == FileIngestionMethod::Recursive {
      nar::restore_path(&dump_to, hashing_source)?
    } else {
      let mut new_file = File::create(&dump_to)?;
      std::io::copy(&mut hashing_source, &mut new_file)?;
    }

    let (_, hash, _) = hash_sink.finish();

    let dst_path =
      self.make_fixed_output_path(method, hash, name, &Default::default(), false)?;

    if !self.is_valid_path(&dst_path)? {
      let real_path = self.to_real_path(&dst_path);
      rm_rf::ensure_removed(&real_path)?;
      std::fs::rename(&dump_to, &real_path)?;
    }

    // the path info records the archive hash, not the flat one
    let mut nar_sink = HashSink::new(HashType::SHA256, std::io::sink());
    nar::dump_path(self.to_real_path(&dst_path), &mut nar_sink, &PathFilter::none())?;
    let (_, nar_hash, nar_size) = nar_sink.finish();

    let mut info = ValidPathInfo::new(dst_path.clone(), nar_hash);
    info.nar_size = Some(nar_size);
    info.registration_time = Some(SystemTime::now());
    info.ultimate = true;
    info.ca = Some(ContentAddress::Fixed(FixedOutputHash { method, hash }));
    self.register_valid_path(info);

    Ok(dst_path)
  }

  fn build_derivation(
    &self,
    drv_path: &StorePath,
    _drv: &Derivation,
    _mode: BuildMode,
  ) -> Result<BuildResult> {
    debug!("refusing to build"; "path" => %drv_path);
    Err(unsupported("buildDerivation"))
  }
}

/// Read-only view of store objects with a validity check in front; stat,
/// list, read, follow.
pub struct FsAccessor<'s> {
  store: &'s LocalStore,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FsStat {
  Missing,
  Regular { size: u64, executable: bool },
  Directory,
  Symlink,
}

impl<'s> FsAccessor<'s> {
  fn to_real_path(&self, path: &Path) -> Result<PathBuf> {
    let store_path = self.store.follow_links_to_store_path(path)?;
    if !self.store.is_valid_path(&store_path)? {
      return Err(InvalidPath(self.store.print_store_path(&store_path)).into());
    }
    let rest = path.strip_prefix(self.store.store_dir())?;
    Ok(self.store.store_dir().join(rest))
  }

  pub fn stat(&self, path: &Path) -> Result<FsStat> {
    let real_path = self.to_real_path(path)?;
    let meta = match std::fs::symlink_metadata(&real_path) {
      Ok(meta) => meta,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FsStat::Missing),
      Err(e) => return Err(e.into()),
    };
    let ty = meta.file_type();
    if ty.is_file() {
      use std::os::unix::fs::PermissionsExt;
      Ok(FsStat::Regular {
        size: meta.len(),
        executable: meta.permissions().mode() & 0o100 != 0,
      })
    } else if ty.is_dir() {
      Ok(FsStat::Directory)
    } else if ty.is_symlink() {
      Ok(FsStat::Symlink)
    } else {
      bail!("file `{}' has an unsupported type", path.display())
    }
  }

  pub fn read_directory(&self, path: &Path) -> Result<PathSet> {
    let real_path = self.to_real_path(path)?;
    let mut names = PathSet::new();
    for entry in std::fs::read_dir(real_path)? {
      names.insert(
        entry?
          .file_name()
          .into_string()
          .map_err(|n| anyhow!("entry name {:?} is not valid unicode", n))?,
      );
    }
    Ok(names)
  }

  pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
    Ok(std::fs::read(self.to_real_path(path)?)?)
  }

  pub fn read_link(&self, path: &Path) -> Result<PathBuf> {
    Ok(std::fs::read_link(self.to_real_path(path)?)?)
  }
}
