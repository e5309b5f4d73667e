//! A store on a remote host reached by running `cask-store --serve
//! --write` over ssh. One protocol round-trip per operation; connections
//! are pooled and dropped as soon as a command fails mid-stream.

use crate::cache::{DiskCache, PathInfoCache};
use crate::prelude::*;
use crate::uri::StoreParams;
use crate::wire;
use crate::{BuildMode, BuildResult, BuildStatus, Callback, ClosureOpts, Settings, Store};
use slog_scope::{debug, warn};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::SystemTime;

pub const SERVE_MAGIC_1: u64 = 0x390c9deb;
pub const SERVE_MAGIC_2: u64 = 0x5452eecb;
pub const SERVE_PROTOCOL_VERSION: u64 = 0x205;

pub const EXPORT_MAGIC: u64 = 0x4558494e;

const CMD_QUERY_VALID_PATHS: u64 = 1;
const CMD_QUERY_PATH_INFOS: u64 = 2;
const CMD_DUMP_STORE_PATH: u64 = 3;
const CMD_IMPORT_PATHS: u64 = 4;
const CMD_QUERY_CLOSURE: u64 = 7;
const CMD_BUILD_DERIVATION: u64 = 8;
const CMD_ADD_TO_STORE_NAR: u64 = 9;

fn major(version: u64) -> u64 {
  version & 0xff00
}

fn minor(version: u64) -> u64 {
  version & 0x00ff
}

pub struct Connection {
  child: Child,
  to: BufWriter<std::process::ChildStdin>,
  from: BufReader<std::process::ChildStdout>,
  remote_version: u64,
  good: bool,
}

impl Drop for Connection {
  fn drop(&mut self) {
    let _ = self.child.kill();
    let _ = self.child.wait();
  }
}

pub struct LegacySshStore {
  host: String,
  store: PathBuf,
  cache: PathInfoCache,
  connections: Pool<Connection>,
}

const KNOWN_PARAMS: &[&str] = &[
  "max-connections",
  "ssh-key",
  "compress",
  "remote-program",
  "remote-store",
  "store",
];

impl LegacySshStore {
  pub fn open(host: &str, params: &StoreParams) -> Result<Self> {
    crate::uri::warn_unknown_params(params, KNOWN_PARAMS);

    let max_connections = params
      .get("max-connections")
      .map(|v| v.parse::<usize>())
      .transpose()
      .context("max-connections must be a number")?
      .unwrap_or(1);
    let ssh_key = params.get("ssh-key").cloned();
    let compress = params.get("compress").map(|v| v == "true").unwrap_or(false);
    let remote_program = params
      .get("remote-program")
      .cloned()
      .unwrap_or_else(|| "cask-store".to_string());
    let remote_store = params.get("remote-store").cloned().unwrap_or_default();
    let store = params
      .get("store")
      .map(PathBuf::from)
      .unwrap_or_else(|| Settings::get().store_dir().to_path_buf());

    let host_for_factory = host.to_string();
    let connections = Pool::new(
      max_connections.max(1),
      move || {
        open_connection(
          &host_for_factory,
          ssh_key.as_deref(),
          compress,
          &remote_program,
          &remote_store,
        )
      },
      |conn: &Connection| conn.good,
    );

    let cache = match DiskCache::shared() {
      Ok(disk) => PathInfoCache::new().with_disk(disk),
      Err(e) => {
        warn!("narinfo disk cache is unavailable: {:#}", e);
        PathInfoCache::new()
      }
    };

    Ok(Self {
      host: host.to_string(),
      store,
      cache,
      connections,
    })
  }

  /// Run one protocol command; any failure poisons the connection so the
  /// pool will not reuse it.
  fn command<T>(
    &self,
    body: impl FnOnce(&mut Connection) -> Result<T>,
  ) -> Result<T> {
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

fn open_connection(
  host: &str,
  ssh_key: Option<&str>,
  compress: bool,
  remote_program: &str,
  remote_store: &str,
) -> Result<Connection> {
  let mut cmd = Command::new("ssh");
  cmd.arg("-x").arg("-a");
  if let Some(key) = ssh_key {
    cmd.arg("-i").arg(key);
  }
  if compress {
    cmd.arg("-C");
  }
  let mut remote = format!("{} --serve --write", remote_program);
  if !remote_store.is_empty() {
    remote.push_str(&format!(" --store {}", remote_store));
  }
  cmd.arg(host).arg("--").arg(remote);
  cmd
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::inherit());

  let mut child = cmd.spawn().with_context(|| format!("starting ssh to `{}'", host))?;
  let to = BufWriter::new(child.stdin.take().expect("piped stdin"));
  let from = BufReader::new(child.stdout.take().expect("piped stdout"));

  let mut conn = Connection {
    child,
    to,
    from,
    remote_version: 0,
    good: true,
  };

  let handshake = (|| -> Result<()> {
    wire::write_u64(&mut conn.to, SERVE_MAGIC_1)?;
    wire::write_u64(&mut conn.to, SERVE_PROTOCOL_VERSION)?;
    conn.to.flush()?;

    let magic = wire::read_u64(&mut conn.from)?;
    ensure!(
      magic == SERVE_MAGIC_2,
      "protocol mismatch with `--serve' on `{}'",
      host
    );
    conn.remote_version = wire::read_u64(&mut conn.from)?;
    ensure!(
      major(conn.remote_version) == 0x200,
      "unsupported `--serve' protocol version on `{}'",
      host
    );
    Ok(())
  })();

  match handshake {
    Ok(()) => Ok(conn),
    Err(e) => {
      if e.downcast_ref::<EndOfFile>().is_some() {
        bail!("cannot connect to `{}'", host)
      }
      Err(e)
    }
  }
}

impl Store for LegacySshStore {
  fn store_dir(&self) -> &Path {
    &self.store
  }

  fn uri(&self) -> String {
    format!("ssh://{}", self.host)
  }

  fn info_cache(&self) -> &PathInfoCache {
    &self.cache
  }

  fn query_path_info_uncached<'s>(
    &'s self,
    path: &StorePath,
    callback: Callback<'s, Option<ValidPathInfo>>,
  ) {
    let result = self.command(|conn| -> Result<Option<ValidPathInfo>> {
      debug!(
        "querying remote host `{}' for info on `{}'",
        self.host,
        self.print_store_path(path)
      );

      wire::write_u64(&mut conn.to, CMD_QUERY_PATH_INFOS)?;
      wire::write_strings(&mut conn.to, [self.print_store_path(path)])?;
      conn.to.flush()?;

      let returned = wire::read_string(&mut conn.from)?;
      if returned.is_empty() {
        return Ok(None);
      }
      let returned_path = self.parse_store_path(Path::new(&returned))?;
      ensure!(
        returned_path == *path,
        "remote returned info for `{}', expected `{}'",
        returned,
        self.print_store_path(path)
      );

      let mut info = ValidPathInfo {
        path: returned_path,
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
      let refs = wire::read_store_paths(self, &mut conn.from)?;
      info.set_references_possibly_to_self(refs);

      let _download_size = wire::read_u64(&mut conn.from)?;
      info.nar_size = Some(wire::read_u64(&mut conn.from)?);

      if minor(conn.remote_version) >= 4 {
        let nar_hash = wire::read_string(&mut conn.from)?;
        if !nar_hash.is_empty() {
          info.nar_hash = Some(Hash::decode(&nar_hash)?);
        }
        info.ca = ContentAddress::parse_opt(&wire::read_string(&mut conn.from)?)?;
        for sig in wire::read_string_set(&mut conn.from)? {
          info.sigs.insert(sig);
        }
      }

      let terminator = wire::read_string(&mut conn.from)?;
      ensure!(terminator.is_empty(), "unexpected trailing response data");

      Ok(Some(info))
    });

    callback.call(result)
  }

  fn add_to_store(
    &self,
    info: &ValidPathInfo,
    source: &mut dyn Read,
    _repair: Repair,
    _check_sigs: CheckSigs,
  ) -> Result<()> {
    debug!(
      "adding path `{}' to remote host `{}'",
      self.print_store_path(&info.path),
      self.host
    );

    self.command(|conn| {
      if minor(conn.remote_version) >= 5 {
        wire::write_u64(&mut conn.to, CMD_ADD_TO_STORE_NAR)?;
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
        wire::write_u64(&mut conn.to, unix_time(info.registration_time))?;
        wire::write_u64(&mut conn.to, info.nar_size.unwrap_or(0))?;
        wire::write_bool(&mut conn.to, info.ultimate)?;
        wire::write_strings(&mut conn.to, &info.sigs)?;
        wire::write_string(
          &mut conn.to,
          &ContentAddress::render_opt(info.ca.as_ref()),
        )?;

        nar::copy_nar(source, &mut conn.to)?;
        conn.to.flush()?;
      } else {
        wire::write_u64(&mut conn.to, CMD_IMPORT_PATHS)?;
        wire::write_u64(&mut conn.to, 1)?;

        nar::copy_nar(source, &mut conn.to)?;
        wire::write_u64(&mut conn.to, EXPORT_MAGIC)?;
        wire::write_string(&mut conn.to, &self.print_store_path(&info.path))?;
        wire::write_store_paths(self, &mut conn.to, &info.references_possibly_to_self())?;
        wire::write_string(
          &mut conn.to,
          &info
            .deriver
            .as_ref()
            .map(|d| self.print_store_path(d))
            .unwrap_or_default(),
        )?;
        wire::write_u64(&mut conn.to, 0)?;
        wire::write_u64(&mut conn.to, 0)?;
        conn.to.flush()?;
      }

      let status = wire::read_u64(&mut conn.from)?;
      ensure!(
        status == 1,
        "failed to add path `{}' to remote host `{}'",
        self.print_store_path(&info.path),
        self.host
      );
      Ok(())
    })
  }

  fn nar_from_path(&self, path: &StorePath, sink: &mut dyn Write) -> Result<()> {
    self.command(|conn| {
      wire::write_u64(&mut conn.to, CMD_DUMP_STORE_PATH)?;
      wire::write_string(&mut conn.to, &self.print_store_path(path))?;
      conn.to.flush()?;
      nar::copy_nar(&mut conn.from, sink)
    })
  }

  fn build_derivation(
    &self,
    drv_path: &StorePath,
    drv: &Derivation,
    _mode: BuildMode,
  ) -> Result<BuildResult> {
    let settings = Settings::get();

    self.command(|conn| {
      wire::write_u64(&mut conn.to, CMD_BUILD_DERIVATION)?;
      wire::write_string(&mut conn.to, &self.print_store_path(drv_path))?;
      drv.write_wire(self, &mut conn.to)?;

      wire::write_u64(&mut conn.to, settings.max_silent_time())?;
      wire::write_u64(&mut conn.to, settings.build_timeout())?;
      if minor(conn.remote_version) >= 2 {
        wire::write_u64(&mut conn.to, settings.max_log_size())?;
      }
      if minor(conn.remote_version) >= 3 {
        wire::write_u64(&mut conn.to, settings.build_repeat())?;
        wire::write_bool(&mut conn.to, settings.enforce_determinism())?;
      }
      conn.to.flush()?;

      let mut result = BuildResult {
        status: BuildStatus::from_wire(wire::read_u64(&mut conn.from)?)?,
        error_msg: wire::read_string(&mut conn.from)?,
        times_built: 0,
        is_non_deterministic: false,
        start_time: 0,
        stop_time: 0,
      };

      if minor(conn.remote_version) >= 3 {
        result.times_built = wire::read_u64(&mut conn.from)?;
        result.is_non_deterministic = wire::read_bool(&mut conn.from)?;
        result.start_time = wire::read_u64(&mut conn.from)?;
        result.stop_time = wire::read_u64(&mut conn.from)?;
      }

      Ok(result)
    })
  }

  fn compute_fs_closure(
    &self,
    paths: &StorePathSet,
    out: &mut StorePathSet,
    opts: ClosureOpts,
  ) -> Result<()> {
    if opts.backwards || opts.include_derivers {
      return crate::closure_via_queries(self, paths, out, opts);
    }

    self.command(|conn| {
      wire::write_u64(&mut conn.to, CMD_QUERY_CLOSURE)?;
      wire::write_bool(&mut conn.to, opts.include_outputs)?;
      wire::write_store_paths(self, &mut conn.to, paths)?;
      conn.to.flush()?;

      for path in wire::read_store_paths(self, &mut conn.from)? {
        out.insert(path);
      }
      Ok(())
    })
  }

  fn query_valid_paths(
    &self,
    paths: &StorePathSet,
    maybe_substitute: Substitute,
  ) -> Result<StorePathSet> {
    self.command(|conn| {
      wire::write_u64(&mut conn.to, CMD_QUERY_VALID_PATHS)?;
      wire::write_bool(&mut conn.to, false)?; // lock
      wire::write_bool(&mut conn.to, maybe_substitute == Substitute::On)?;
      wire::write_store_paths(self, &mut conn.to, paths)?;
      conn.to.flush()?;

      wire::read_store_paths(self, &mut conn.from)
    })
  }

  fn connect(&self) -> Result<()> {
    self.connections.get().map(drop)
  }

  fn get_protocol(&self) -> Result<u64> {
    Ok(self.connections.get()?.remote_version)
  }
}

fn unix_time(t: Option<SystemTime>) -> u64 {
  t.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
    .map(|d| d.as_secs())
    .unwrap_or(0)
}
