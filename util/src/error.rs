//! Distinguished error kinds. Everything travels as [`anyhow::Error`];
//! callers that care recover a kind with `downcast_ref`.

/// The queried path is not registered in the store. `Store::is_valid_path`
/// catches this to answer `false`.
#[derive(Debug, Error)]
#[error("path `{0}' is not valid")]
pub struct InvalidPath(pub String);

/// A path was required to live under the store directory but does not.
#[derive(Debug, Error)]
#[error("path `{0}' is not in the store")]
pub struct NotInStore(pub String);

/// The backend cannot perform the requested operation. The message names
/// the missing operation so callers can report it.
#[derive(Debug, Error)]
#[error("operation `{0}' is not supported by this store backend")]
pub struct Unsupported(pub &'static str);

/// Short read from a remote peer.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EndOfFile(pub String);

/// True when `err` is an [`InvalidPath`] at any depth of the chain.
pub fn is_invalid_path(err: &anyhow::Error) -> bool {
  err.downcast_ref::<InvalidPath>().is_some()
}

/// Build the error every unimplemented backend operation returns.
pub fn unsupported(op: &'static str) -> anyhow::Error {
  Unsupported(op).into()
}
