use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};

static SETTINGS: OnceCell<Settings> = OnceCell::new();

/// Process-wide configuration. Initialise once with `init_with` before the
/// first `get`, or accept the defaults.
#[derive(Debug)]
pub struct Settings {
  store_dir: PathBuf,
  state_dir: PathBuf,
  log_dir: PathBuf,
  daemon_socket_file: PathBuf,
  netrc_file: Option<PathBuf>,
  hashed_mirrors: Vec<String>,
  substituters: Vec<String>,
  extra_substituters: Vec<String>,
  ttl_positive_nar_info_cache: u64,
  ttl_negative_nar_info_cache: u64,
  path_info_cache_size: usize,
  read_only_mode: bool,
  keep_going: bool,
  max_silent_time: u64,
  build_timeout: u64,
  max_log_size: u64,
  build_repeat: u64,
  enforce_determinism: bool,
}

impl Settings {
  pub fn get() -> &'static Self {
    SETTINGS.get_or_init(Self::default)
  }

  pub fn init_with<F: FnOnce(Self) -> Self>(init_fn: F) {
    if SETTINGS.set(init_fn(Self::default())).is_err() {
      panic!("settings have already been initialized")
    }
  }

  pub fn store_dir(&self) -> &Path {
    &self.store_dir
  }

  pub fn state_dir(&self) -> &Path {
    &self.state_dir
  }

  pub fn log_dir(&self) -> &Path {
    &self.log_dir
  }

  pub fn daemon_socket_file(&self) -> &Path {
    &self.daemon_socket_file
  }

  pub fn netrc_file(&self) -> Option<&Path> {
    self.netrc_file.as_deref()
  }

  pub fn hashed_mirrors(&self) -> &[String] {
    &self.hashed_mirrors
  }

  pub fn substituters(&self) -> &[String] {
    &self.substituters
  }

  pub fn extra_substituters(&self) -> &[String] {
    &self.extra_substituters
  }

  pub fn ttl_positive_nar_info_cache(&self) -> u64 {
    self.ttl_positive_nar_info_cache
  }

  pub fn ttl_negative_nar_info_cache(&self) -> u64 {
    self.ttl_negative_nar_info_cache
  }

  pub fn path_info_cache_size(&self) -> usize {
    self.path_info_cache_size
  }

  pub fn read_only_mode(&self) -> bool {
    self.read_only_mode
  }

  pub fn keep_going(&self) -> bool {
    self.keep_going
  }

  pub fn max_silent_time(&self) -> u64 {
    self.max_silent_time
  }

  pub fn build_timeout(&self) -> u64 {
    self.build_timeout
  }

  pub fn max_log_size(&self) -> u64 {
    self.max_log_size
  }

  pub fn build_repeat(&self) -> u64 {
    self.build_repeat
  }

  pub fn enforce_determinism(&self) -> bool {
    self.enforce_determinism
  }

  pub fn set_keep_going(self, keep_going: bool) -> Self {
    Self { keep_going, ..self }
  }

  pub fn set_substituters(self, substituters: Vec<String>) -> Self {
    Self {
      substituters,
      ..self
    }
  }

  pub fn set_ttls(self, positive: u64, negative: u64) -> Self {
    Self {
      ttl_positive_nar_info_cache: positive,
      ttl_negative_nar_info_cache: negative,
      ..self
    }
  }
}

impl Default for Settings {
  fn default() -> Self {
    let state_dir = PathBuf::from("/cask/var/cask");
    Self {
      store_dir: "/cask/store".into(),
      daemon_socket_file: state_dir.join("daemon-socket/socket"),
      log_dir: state_dir.join("log"),
      state_dir,
      netrc_file: None,
      hashed_mirrors: Vec::new(),
      substituters: Vec::new(),
      extra_substituters: Vec::new(),
      // a positive answer stays good for a month; retry missing paths
      // after an hour
      ttl_positive_nar_info_cache: 30 * 24 * 3600,
      ttl_negative_nar_info_cache: 3600,
      path_info_cache_size: 65536,
      read_only_mode: false,
      keep_going: false,
      max_silent_time: 0,
      build_timeout: 0,
      max_log_size: 0,
      build_repeat: 0,
      enforce_determinism: true,
    }
  }
}
