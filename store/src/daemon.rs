//! A proxy for the store daemon on the local machine, speaking the worker
//! protocol over its Unix socket. The daemon interleaves log output with
//! responses, so every round-trip drains a stderr stream first.

use crate::cache::PathInfoCache;
use crate::prelude::*;
use crate::uri::StoreParams;
use crate::wire;
use crate::{BuildMode, BuildResult, BuildStatus, Callback, Settings, Store};
use slog_scope::{debug, info};
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const WORKER_MAGIC_1: u64 = 0x6e697863;
pub const WORKER_MAGIC_2: u64 = 0x6478696f;
/// 1.20: new enough for typed path-info queries, old enough to keep the
/// archive stream unframed.
pub const PROTOCOL_VERSION: u64 = 1 << 8 | 20;

const STDERR_NEXT: u64 = 0x6f6c6d67;
const STDERR_ERROR: u64 = 0x63787470;
const STDERR_LAST: u64 = 0x616c7473;

const OP_IS_VALID_PATH: u64 = 1;
const OP_ADD_TEXT_TO_STORE: u64 = 8;
const OP_ENSURE_PATH: u64 = 10;
const OP_QUERY_PATH_INFO: u64 = 26;
const OP_QUERY_PATH_FROM_HASH_PART: u64 = 29;
const OP_QUERY_VALID_PATHS: u64 = 31;
const OP_BUILD_DERIVATION: u64 = 36;
const OP_NAR_FROM_PATH: u64 = 38;
const OP_ADD_TO_STORE_NAR: u64 = 39;

fn major(version: u64) -> u64 {
  version & 0xff00
}

fn minor(version: u64) -> u64 {
  version & 0x00ff
}

pub struct Connection {
  to: BufWriter<UnixStream>,
  from: BufReader<UnixStream>,
  daemon_version: u64,
  good: bool,
}

impl Connection {
  /// Drain daemon chatter until the response proper starts.
  fn process_stderr(&mut self) -> Result<()> {
    self.to.flush()?;
    loop {
      match wire::read_u64(&mut self.from)? {
        STDERR_NEXT => {
          let msg = wire::read_string(&mut self.from)?;
          info!("{}", msg.trim_end());
        }
        STDERR_ERROR => {
          let msg = wire::read_string(&mut self.from)?;
          let _status = wire::read_u64(&mut self.from)?;
          bail!("{}", msg);
        }
        STDERR_LAST => return Ok(()),
        x => bail!("unknown message {:#x} from the daemon", x),
      }
    }
  }
}

pub struct DaemonStore {
  socket_path: PathBuf,
  store: PathBuf,
  cache: PathInfoCache,
  connections: Pool<Connection>,
}

const KNOWN_PARAMS: &[&str] = &["socket", "store", "max-connections"];

impl DaemonStore {
  pub fn open(params: &StoreParams) -> Result<Self> {
    crate::uri::warn_unknown_params(params, KNOWN_PARAMS);

    let settings = Settings::get();
    let socket_path = params
      .get("socket")
      .map(PathBuf::from)
      .unwrap_or_else(|| settings.daemon_socket_file().to_path_buf());
    let store = params
      .get("store")
      .map(PathBuf::from)
      .unwrap_or_else(|| settings.store_dir().to_path_buf());
    let max_connections = params
      .get("max-connections")
      .map(|v| v.parse::<usize>())
      .transpose()
      .context("max-connections must be a number")?
      .unwrap_or(1);

    let socket_for_factory = socket_path.clone();
    let connections = Pool::new(
      max_connections,
      move || open_connection(&socket_for_factory),
      |conn: &Connection| conn.good,
    );

    Ok(Self {
      socket_path,
      store,
      cache: PathInfoCache::new(),
      connections,
    })
  }

  fn command<T>(&self, body: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let mut conn = self.connections.get()?;
    match body(&mut conn) {
      Ok(v) => Ok(v),
      Err(e) => {
        conn.good = false;
        Err(e)
      }
    }
  }
}

fn open_connection(socket_path: &Path) -> Result<Connection> {
  let stream = UnixStream::connect(socket_path)
    .with_context(|| format!("connecting to daemon at `{}'", socket_path.display()))?;
  stream.set_read_timeout(Some(Duration::from_secs(3600)))?;

  let mut conn = Connection {
    to: BufWriter::new(stream.try_clone()?),
    from: BufReader::new(stream),
    daemon_version: 0,
    good: true,
  };

  wire::write_u64(&mut conn.to, WORKER_MAGIC_1)?;
  conn.to.flush()?;

  let magic = wire::read_u64(&mut conn.from)?;
  ensure!(magic == WORKER_MAGIC_2, "protocol mismatch with the daemon");

  conn.daemon_version = wire::read_u64(&mut conn.from)?;
  ensure!(
    major(conn.daemon_version) == major(PROTOCOL_VERSION),
    "the daemon speaks an incompatible protocol version"
  );
  ensure!(
    minor(conn.daemon_version) >= 10,
    "the daemon is too old for this client"
  );
  wire::write_u64(&mut conn.to, PROTOCOL_VERSION)?;

  if minor(conn.daemon_version) >= 14 {
    // obsolete CPU affinity setting
    wire::write_u64(&mut conn.to, 0)?;
  }
  if minor(conn.daemon_version) >= 11 {
    // obsolete reserve-space setting
    wire::write_bool(&mut conn.to, false)?;
  }

  conn.process_stderr()?;

  debug!(
    "connected to the daemon"; "version" => format!("1.{}", minor(conn.daemon_version))
  );

  Ok(conn)
}

impl Store for DaemonStore {
  fn store_dir(&self) -> &Path {
    &self.store
  }

  fn uri(&self) -> String {
    "daemon".into()
  }

  fn info_cache(&self) -> &PathInfoCache {
    &self.cache
  }

  fn is_valid_path_uncached(&self, path: &StorePath) -> Result<bool> {
    self.command(|conn| {
      wire::write_u64(&mut conn.to, OP_IS_VALID_PATH)?;
      wire::write_string(&mut conn.to, &self.print_store_path(path))?;
      conn.process_stderr()?;
      wire::read_bool(&mut conn.from)
    })
  }

  fn query_path_info_uncached<'s>(
    &'s self,
    path: &StorePath,
    callback: Callback<'s, Option<ValidPathInfo>>,
  ) {
    let result = self.command(|conn| -> Result<Option<ValidPathInfo>> {
      wire::write_u64(&mut conn.to, OP_QUERY_PATH_INFO)?;
      wire::write_string(&mut conn.to, &self.print_store_path(path))?;
      conn.process_stderr()?;

      if minor(conn.daemon_version) >= 17 && !wire::read_bool(&mut conn.from)? {
        return Ok(None);
      }

      let mut info = ValidPathInfo {
        path: path.clone(),
        deriver: None,
        nar_hash: None,
        nar_size: None,
        refs: Default::default(),
        registration_time: None,
        ultimate: false,
        sigs: Default::default(),
        ca: None,
      };

      let deriver = wire::read_string(&mut conn.from)?;
      if !deriver.is_empty() {
        info.deriver = Some(self.parse_store_path(Path::new(&deriver))?);
      }
      let nar_hash = wire::read_string(&mut conn.from)?;
      if !nar_hash.is_empty() {
        info.nar_hash = Some(Hash::decode_with_type(&nar_hash, HashType::SHA256, false)?);
      }
      info.set_references_possibly_to_self(wire::read_store_paths(self, &mut conn.from)?);
      let registration = wire::read_u64(&mut conn.from)?;
      if registration > 0 {
        info.registration_time =
          Some(SystemTime::UNIX_EPOCH + Duration::from_secs(registration));
      }
      info.nar_size = Some(wire::read_u64(&mut conn.from)?);

      if minor(conn.daemon_version) >= 16 {
        info.ultimate = wire::read_bool(&mut conn.from)?;
        for sig in wire::read_string_set(&mut conn.from)? {
          info.sigs.insert(sig);
        }
        info.ca = ContentAddress::parse_opt(&wire::read_string(&mut conn.from)?)?;
      }

      Ok(Some(info))
    });

    callback.call(result)
  }

  fn query_valid_paths(
    &self,
    paths: &StorePathSet,
    _maybe_substitute: Substitute,
  ) -> Result<StorePathSet> {
    self.command(|conn| {
      wire::write_u64(&mut conn.to, OP_QUERY_VALID_PATHS)?;
      wire::write_store_paths(self, &mut conn.to, paths)?;
      conn.process_stderr()?;
      wire::read_store_paths(self, &mut conn.from)
    })
  }

  fn query_path_from_hash_part(&self, hash_part: &str) -> Result<Option<StorePath>> {
    self.command(|conn| {
      wire::write_u64(&mut conn.to, OP_QUERY_PATH_FROM_HASH_PART)?;
      wire::write_string(&mut conn.to, hash_part)?;
      conn.process_stderr()?;
      let path = wire::read_string(&mut conn.from)?;
      if path.is_empty() {
        Ok(None)
      } else {
        Ok(Some(self.parse_store_path(Path::new(&path))?))
      }
    })
  }

  fn add_to_store(
    &self,
    info: &ValidPathInfo,
    source: &mut dyn Read,
    repair: Repair,
    check_sigs: CheckSigs,
  ) -> Result<()> {
    self.command(|conn| {
      wire::write_u64(&mut conn.to, OP_ADD_TO_STORE_NAR)?;
      wire::write_string(&mut conn.to, &self.print_store_path(&info.path))?;
      wire::write_string(
        &mut conn.to,
        &info
          .deriver
          .as_ref()
          .map(|d| self.print_store_path(d))
          .unwrap_or_default(),
      )?;
      wire::write_string(
        &mut conn.to,
        &info
          .nar_hash
          .map(|h| h.encode(Encoding::Base16))
          .unwrap_or_default(),
      )?;
      wire::write_store_paths(self, &mut conn.to, &info.references_possibly_to_self())?;
      wire::write_u64(
        &mut conn.to,
        info
          .registration_time
          .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
          .map(|d| d.as_secs())
          .unwrap_or(0),
      )?;
      wire::write_u64(&mut conn.to, info.nar_size.unwrap_or(0))?;
      wire::write_bool(&mut conn.to, info.ultimate)?;
      wire::write_strings(&mut conn.to, &info.sigs)?;
      wire::write_string(&mut conn.to, &ContentAddress::render_opt(info.ca.as_ref()))?;
      wire::write_bool(&mut conn.to, repair == Repair::On)?;
      wire::write_bool(&mut conn.to, check_sigs == CheckSigs::Off)?;

      nar::copy_nar(source, &mut conn.to)?;
      conn.process_stderr()
    })
  }

  fn add_text_to_store(
    &self,
    name: &str,
    contents: &[u8],
    refs: &StorePathSet,
    _repair: Repair,
  ) -> Result<StorePath> {
    self.command(|conn| {
      wire::write_u64(&mut conn.to, OP_ADD_TEXT_TO_STORE)?;
      wire::write_string(&mut conn.to, name)?;
      wire::write_bytes(&mut conn.to, contents)?;
      wire::write_store_paths(self, &mut conn.to, refs)?;
      conn.process_stderr()?;
      let path = wire::read_string(&mut conn.from)?;
      self.parse_store_path(Path::new(&path))
    })
  }

  fn nar_from_path(&self, path: &StorePath, sink: &mut dyn Write) -> Result<()> {
    self.command(|conn| {
      wire::write_u64(&mut conn.to, OP_NAR_FROM_PATH)?;
      wire::write_string(&mut conn.to, &self.print_store_path(path))?;
      conn.process_stderr()?;
      nar::copy_nar(&mut conn.from, sink)
    })
  }

  fn ensure_path(&self, path: &StorePath) -> Result<()> {
    self.command(|conn| {
      wire::write_u64(&mut conn.to, OP_ENSURE_PATH)?;
      wire::write_string(&mut conn.to, &self.print_store_path(path))?;
      conn.process_stderr()?;
      let _ = wire::read_u64(&mut conn.from)?;
      Ok(())
    })
  }

  fn build_derivation(
    &self,
    drv_path: &StorePath,
    drv: &Derivation,
    mode: BuildMode,
  ) -> Result<BuildResult> {
    self.command(|conn| {
      wire::write_u64(&mut conn.to, OP_BUILD_DERIVATION)?;
      wire::write_string(&mut conn.to, &self.print_store_path(drv_path))?;
      drv.write_wire(self, &mut conn.to)?;
      wire::write_u64(
        &mut conn.to,
        match mode {
          BuildMode::Build => 0,
          BuildMode::Repair => 1,
          BuildMode::Check => 2,
        },
      )?;
      conn.process_stderr()?;

      Ok(BuildResult {
        status: BuildStatus::from_wire(wire::read_u64(&mut conn.from)?)?,
        error_msg: wire::read_string(&mut conn.from)?,
        times_built: 0,
        is_non_deterministic: false,
        start_time: 0,
        stop_time: 0,
      })
    })
  }

  fn connect(&self) -> Result<()> {
    self.connections.get().map(drop)
  }

  fn get_protocol(&self) -> Result<u64> {
    Ok(self.connections.get()?.daemon_version)
  }
}

impl std::fmt::Debug for DaemonStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DaemonStore")
      .field("socket_path", &self.socket_path)
      .field("store", &self.store)
      .finish()
  }
}
