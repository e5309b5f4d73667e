//! Opening stores by URI: `daemon`, `local`, `auto`, an absolute or
//! relative path, `ssh://host`, plus whatever else has been registered.
//! Query-string pairs become store parameters.

use crate::daemon::DaemonStore;
use crate::local::LocalStore;
use crate::prelude::*;
use crate::serve::LegacySshStore;
use crate::Settings;
use parking_lot::RwLock;
use slog_scope::warn;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub type StoreParams = BTreeMap<String, String>;

pub type StoreFactory =
  fn(uri: &str, params: &StoreParams) -> Result<Option<Arc<dyn Store>>>;

lazy_static! {
  static ref REGISTRY: RwLock<Vec<StoreFactory>> = RwLock::new(vec![open_serve, open_default]);
}

/// Register an additional backend; factories are tried in order and the
/// first one claiming the URI wins.
pub fn register_store_factory(factory: StoreFactory) {
  REGISTRY.write().push(factory);
}

/// Warn about query parameters a backend does not consume; unknown keys
/// are tolerated but never silently dropped.
pub(crate) fn warn_unknown_params(params: &StoreParams, known: &[&str]) {
  for key in params.keys() {
    if !known.contains(&key.as_str()) {
      warn!("unknown store parameter `{}'", key);
    }
  }
}

/// Split `scheme://...?k=v&k2=v2` into the bare URI and its parameters.
pub fn split_uri_params(uri: &str) -> (String, StoreParams) {
  let (uri, query) = match break_str(uri, '?') {
    Some((uri, query)) => (uri, query),
    None => return (uri.to_string(), StoreParams::new()),
  };

  let mut params = StoreParams::new();
  for pair in query.split('&').filter(|p| !p.is_empty()) {
    match break_str(pair, '=') {
      Some((key, value)) => params.insert(key.to_string(), value.to_string()),
      None => params.insert(pair.to_string(), String::new()),
    };
  }
  (uri.to_string(), params)
}

pub fn open_store(uri: &str) -> Result<Arc<dyn Store>> {
  open_store_with(uri, StoreParams::new())
}

pub fn open_store_with(uri: &str, extra_params: StoreParams) -> Result<Arc<dyn Store>> {
  let (uri, mut params) = split_uri_params(uri);
  params.extend(extra_params);

  for factory in REGISTRY.read().iter() {
    if let Some(store) = factory(&uri, &params)? {
      return Ok(store);
    }
  }

  bail!("don't know how to open store `{}'", uri)
}

enum StoreKind {
  Daemon,
  Local,
  Other,
}

fn store_kind(uri: &str, state_dir: &Path) -> StoreKind {
  if uri == "daemon" {
    StoreKind::Daemon
  } else if uri == "local" || uri.starts_with('/') || uri.starts_with("./") {
    StoreKind::Local
  } else if uri.is_empty() || uri == "auto" {
    // writable state means we can be our own store; otherwise look for a
    // daemon to delegate to
    if is_writable_dir(state_dir) {
      StoreKind::Local
    } else if Settings::get().daemon_socket_file().exists() {
      StoreKind::Daemon
    } else {
      StoreKind::Local
    }
  } else {
    StoreKind::Other
  }
}

fn is_writable_dir(path: &Path) -> bool {
  use std::os::unix::fs::MetadataExt;
  let meta = match std::fs::metadata(path) {
    Ok(meta) => meta,
    Err(_) => return false,
  };
  if !meta.is_dir() {
    return false;
  }
  // cheap check: owned by us and owner-writable, or world-writable
  let mode = meta.mode();
  let euid = nix::unistd::geteuid().as_raw();
  (meta.uid() == euid && mode & 0o200 != 0) || mode & 0o002 != 0
}

fn open_default(uri: &str, params: &StoreParams) -> Result<Option<Arc<dyn Store>>> {
  let state_dir = params
    .get("state")
    .map(std::path::PathBuf::from)
    .unwrap_or_else(|| Settings::get().state_dir().to_path_buf());

  match store_kind(uri, &state_dir) {
    StoreKind::Daemon => Ok(Some(Arc::new(DaemonStore::open(params)?))),
    StoreKind::Local => {
      let mut params = params.clone();
      if uri.starts_with('/') {
        params.insert("root".into(), uri.to_string());
      } else if uri.starts_with("./") {
        params.insert(
          "root".into(),
          std::fs::canonicalize(uri)?.display().to_string(),
        );
      }
      Ok(Some(Arc::new(LocalStore::open(&params)?)))
    }
    StoreKind::Other => Ok(None),
  }
}

fn open_serve(uri: &str, params: &StoreParams) -> Result<Option<Arc<dyn Store>>> {
  match uri.strip_prefix("ssh://") {
    Some(host) => Ok(Some(Arc::new(LegacySshStore::open(host, params)?))),
    None => Ok(None),
  }
}

/// The stores consulted to obtain a path instead of building it, in
/// configuration order with duplicates dropped. Stores that fail to open
/// are skipped with a warning.
pub fn default_substituters() -> Vec<Arc<dyn Store>> {
  let settings = Settings::get();
  let mut seen = std::collections::BTreeSet::new();
  let mut stores = Vec::new();

  for uri in settings
    .substituters()
    .iter()
    .chain(settings.extra_substituters())
  {
    if !seen.insert(uri.clone()) {
      continue;
    }
    match open_store(uri) {
      Ok(store) => stores.push(store),
      Err(e) => warn!("could not open substituter `{}': {:#}", uri, e),
    }
  }

  stores
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn uri_params_split() {
    let (uri, params) = split_uri_params("ssh://cache.example.org?max-connections=4&compress=true");
    assert_eq!(uri, "ssh://cache.example.org");
    assert_eq!(params.get("max-connections").unwrap(), "4");
    assert_eq!(params.get("compress").unwrap(), "true");

    let (uri, params) = split_uri_params("daemon");
    assert_eq!(uri, "daemon");
    assert!(params.is_empty());
  }

  #[test]
  fn open_local_store_by_path() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().display().to_string()).unwrap();
    assert!(store.uri().starts_with("local"));
    assert!(store.store_dir().starts_with(dir.path()));
  }

  #[test]
  fn unknown_uris_are_rejected() {
    assert!(open_store("gopher://example.org").is_err());
  }
}
