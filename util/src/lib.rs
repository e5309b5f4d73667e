#[macro_use] extern crate derive_more;
#[macro_use] extern crate thiserror;

#[doc(no_inline)] pub use anyhow::{anyhow, bail, ensure, Context as _, Result};
pub use error::{is_invalid_path, unsupported, EndOfFile, InvalidPath, NotInStore, Unsupported};
pub use hash::{
  Context as HashContext, Encoding, Hash, HashType, ModuloSink as HashModuloSink,
  Sink as HashSink,
};
pub use nar::PathFilter;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
pub use pool::Pool;
pub use rusqlite::{named_params, params, OptionalExtension as _};
pub use sqlite::Sqlite;
use std::fs::File;
use std::os::unix::prelude::FromRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub mod base32;
pub mod error;
pub mod hash;
pub mod logger;
pub mod nar;
pub mod pool;
pub mod sqlite;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Request cooperative cancellation of in-flight store operations.
pub fn trigger_interrupt() {
  INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Polled at I/O boundaries and between graph nodes by long-running
/// operations.
pub fn check_interrupt() -> Result<()> {
  if INTERRUPTED.load(Ordering::SeqCst) {
    bail!("interrupted by the user")
  }
  Ok(())
}

/// Split `s` around the first occurrence of `sep`.
pub fn break_str(s: &str, sep: char) -> Option<(&str, &str)> {
  s.split_once(sep)
}

pub trait PathExt {
  fn append<P: AsRef<Path>>(&self, other: P) -> PathBuf;
}

impl PathExt for Path {
  fn append<P: AsRef<Path>>(&self, other: P) -> PathBuf {
    let other = other.as_ref();
    self.join(other.strip_prefix("/").unwrap_or(other))
  }
}

pub fn pipe() -> Result<(impl std::io::Read, impl std::io::Write)> {
  let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
  Ok(unsafe { (File::from_raw_fd(read), File::from_raw_fd(write)) })
}
