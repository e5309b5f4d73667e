pub use crate::content_address::{
  CaInfo, ContentAddress, ContentAddressWithRefs, FileIngestionMethod, FixedOutputHash,
  FixedOutputInfo, IpfsHash, IpfsInfo, IpfsRef, PathReferences, TextHash, TextInfo,
};
pub use crate::derivation::{Derivation, DerivationType, HashModulo, Output};
pub use crate::path::StorePath;
pub use crate::path_info::ValidPathInfo;
pub use crate::{Store, StorePathSet};
pub use anyhow::{Context as _, Result};
pub use cask_util::*;

/// Whether an existing, possibly corrupt copy of a path should be
/// overwritten.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Repair {
  Off,
  On,
}

/// Whether signatures are required when importing a path.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CheckSigs {
  Off,
  On,
}

/// Whether a validity query may consult substituters.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Substitute {
  Off,
  On,
}
