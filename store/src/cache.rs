//! The two cache levels in front of `query_path_info_uncached`: a bounded
//! in-memory LRU with separate positive and negative TTLs, and a shared
//! on-disk cache that outlives the process.

use crate::prelude::*;
use crate::settings::Settings;
use lru::LruCache;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::json;
use std::num::NonZeroUsize;
use std::path::Path as StdPath;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

#[derive(Clone)]
pub struct CacheEntry {
  /// `None` records a negative result.
  pub value: Option<Arc<ValidPathInfo>>,
  pub time_point: Instant,
}

impl CacheEntry {
  pub fn did_exist(&self) -> bool {
    self.value.is_some()
  }

  fn is_known_now(&self, ttl_positive: Duration, ttl_negative: Duration) -> bool {
    let ttl = if self.did_exist() {
      ttl_positive
    } else {
      ttl_negative
    };
    Instant::now() < self.time_point + ttl
  }
}

pub struct PathInfoCache {
  mem: Mutex<LruCache<String, CacheEntry>>,
  disk: Option<&'static DiskCache>,
  ttl_positive: Duration,
  ttl_negative: Duration,
  reads_averted: AtomicU64,
  missing: AtomicU64,
}

impl PathInfoCache {
  pub fn new() -> Self {
    let settings = Settings::get();
    Self::with_config(
      settings.path_info_cache_size(),
      Duration::from_secs(settings.ttl_positive_nar_info_cache()),
      Duration::from_secs(settings.ttl_negative_nar_info_cache()),
    )
  }

  pub fn with_config(size: usize, ttl_positive: Duration, ttl_negative: Duration) -> Self {
    Self {
      mem: Mutex::new(LruCache::new(
        NonZeroUsize::new(size.max(1)).unwrap(),
      )),
      disk: None,
      ttl_positive,
      ttl_negative,
      reads_averted: AtomicU64::new(0),
      missing: AtomicU64::new(0),
    }
  }

  pub fn with_disk(mut self, disk: &'static DiskCache) -> Self {
    self.disk = Some(disk);
    self
  }

  pub fn disk(&self) -> Option<&'static DiskCache> {
    self.disk
  }

  /// A hit within its TTL; expired entries read as misses and age out via
  /// LRU eviction.
  pub fn lookup(&self, hash_part: &str) -> Option<CacheEntry> {
    let mut mem = self.mem.lock();
    let entry = mem.get(hash_part)?;
    if entry.is_known_now(self.ttl_positive, self.ttl_negative) {
      let entry = entry.clone();
      self.reads_averted.fetch_add(1, Ordering::Relaxed);
      Some(entry)
    } else {
      None
    }
  }

  pub fn upsert(&self, hash_part: String, value: Option<Arc<ValidPathInfo>>) {
    self.mem.lock().put(
      hash_part,
      CacheEntry {
        value,
        time_point: Instant::now(),
      },
    );
  }

  pub fn record_missing(&self) {
    self.missing.fetch_add(1, Ordering::Relaxed);
  }

  pub fn reads_averted(&self) -> u64 {
    self.reads_averted.load(Ordering::Relaxed)
  }

  pub fn nr_missing(&self) -> u64 {
    self.missing.load(Ordering::Relaxed)
  }
}

impl Default for PathInfoCache {
  fn default() -> Self {
    Self::new()
  }
}

pub enum DiskCacheOutcome {
  /// Nothing recorded; ask the backend.
  Unknown,
  Invalid,
  Valid(ValidPathInfo),
}

const SCHEMA: &str = "
  create table if not exists NarInfos (
      cache     text not null,
      hashPart  text not null,
      present   integer not null,
      info      text not null,
      timestamp integer not null,
      primary key (cache, hashPart)
  );
";

const LOOKUP: &str = "select present, info from NarInfos where cache = :cache and hashPart = :hashPart";

const UPSERT: &str = "insert or replace into NarInfos(cache, hashPart, present, info, timestamp) \
                      values (:cache, :hashPart, :present, :info, :timestamp)";

/// The on-disk narinfo cache, shared by every store handle in the process.
pub struct DiskCache(Sqlite);

static DISK_CACHE: OnceCell<DiskCache> = OnceCell::new();

impl DiskCache {
  pub fn shared() -> Result<&'static Self> {
    DISK_CACHE.get_or_try_init(|| {
      let dir = dirs::cache_dir()
        .ok_or_else(|| anyhow!("no cache directory configured"))?
        .join("cask");
      std::fs::create_dir_all(&dir)?;
      Self::open(dir.join("narinfo-cache-v1.sqlite"))
    })
  }

  pub fn open<P: AsRef<StdPath>>(path: P) -> Result<Self> {
    let db = Sqlite::open(path)?;
    db.lock().execute_batch(&format!(
      "pragma synchronous = off; pragma main.journal_mode = truncate; {}",
      SCHEMA
    ))?;
    Ok(Self(db))
  }

  pub fn lookup<S: Store + ?Sized>(
    &self,
    store: &S,
    cache_uri: &str,
    hash_part: &str,
  ) -> Result<DiskCacheOutcome> {
    let conn = self.0.lock();
    let mut stmt = conn.prepare(LOOKUP)?;

    let row = stmt
      .query_and_then::<_, anyhow::Error, _, _>(
        named_params! { ":cache": cache_uri, ":hashPart": hash_part },
        |row| {
          let present = row.get::<_, bool>(0)?;
          let info = row.get::<_, String>(1)?;
          Ok((present, info))
        },
      )?
      .next()
      .transpose()?;

    match row {
      None => Ok(DiskCacheOutcome::Unknown),
      Some((false, _)) => Ok(DiskCacheOutcome::Invalid),
      Some((true, doc)) => Ok(DiskCacheOutcome::Valid(decode_info(store, &doc)?)),
    }
  }

  pub fn upsert<S: Store + ?Sized>(
    &self,
    store: &S,
    cache_uri: &str,
    hash_part: &str,
    info: Option<&ValidPathInfo>,
  ) -> Result<()> {
    let doc = match info {
      Some(info) => encode_info(store, info)?,
      None => String::new(),
    };
    self.0.lock().execute(
      UPSERT,
      named_params! {
        ":cache": cache_uri,
        ":hashPart": hash_part,
        ":present": info.is_some(),
        ":info": doc,
        ":timestamp": unix_time(),
      },
    )?;
    Ok(())
  }
}

fn encode_info<S: Store + ?Sized>(store: &S, info: &ValidPathInfo) -> Result<String> {
  let doc = json!({
    "path": store.print_store_path(&info.path),
    "deriver": info.deriver.as_ref().map(|d| store.print_store_path(d)),
    "narHash": info.nar_hash.map(|h| h.encode_with_type(Encoding::Base32)),
    "narSize": info.nar_size,
    "references": info.refs.references.iter().map(|r| store.print_store_path(r)).collect::<Vec<_>>(),
    "hasSelfReference": info.refs.has_self_reference,
    "registrationTime": info.registration_time.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok()).map(|d| d.as_secs()),
    "sigs": info.sigs,
    "ca": ContentAddress::render_opt(info.ca.as_ref()),
  });
  Ok(doc.to_string())
}

fn decode_info<S: Store + ?Sized>(store: &S, doc: &str) -> Result<ValidPathInfo> {
  let doc: serde_json::Value = serde_json::from_str(doc)?;
  let get_str = |key: &str| -> Result<&str> {
    doc
      .get(key)
      .and_then(|v| v.as_str())
      .ok_or_else(|| anyhow!("narinfo cache entry is missing `{}'", key))
  };

  let path = store.parse_store_path(StdPath::new(get_str("path")?))?;
  let mut info = ValidPathInfo {
    path,
    deriver: None,
    nar_hash: None,
    nar_size: doc.get("narSize").and_then(|v| v.as_u64()),
    refs: Default::default(),
    registration_time: doc
      .get("registrationTime")
      .and_then(|v| v.as_u64())
      .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
    ultimate: false,
    sigs: Default::default(),
    ca: None,
  };

  if let Some(deriver) = doc.get("deriver").and_then(|v| v.as_str()) {
    info.deriver = Some(store.parse_store_path(StdPath::new(deriver))?);
  }
  if let Some(hash) = doc.get("narHash").and_then(|v| v.as_str()) {
    info.nar_hash = Some(Hash::decode(hash)?);
  }
  if let Some(refs) = doc.get("references").and_then(|v| v.as_array()) {
    for r in refs {
      let r = r
        .as_str()
        .ok_or_else(|| anyhow!("narinfo cache entry has a malformed reference"))?;
      info
        .refs
        .references
        .insert(store.parse_store_path(StdPath::new(r))?);
    }
  }
  info.refs.has_self_reference = doc
    .get("hasSelfReference")
    .and_then(|v| v.as_bool())
    .unwrap_or(false);
  if let Some(sigs) = doc.get("sigs").and_then(|v| v.as_array()) {
    for sig in sigs {
      if let Some(sig) = sig.as_str() {
        info.sigs.insert(sig.to_string());
      }
    }
  }
  info.ca = ContentAddress::parse_opt(get_str("ca").unwrap_or(""))?;

  Ok(info)
}

fn unix_time() -> i64 {
  SystemTime::now()
    .duration_since(SystemTime::UNIX_EPOCH)
    .map(|d| d.as_secs() as i64)
    .unwrap_or(0)
}
