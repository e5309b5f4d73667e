use crate::prelude::*;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

mod parse;
mod print;
mod wire;

pub use parse::FormatError;
pub use print::Print;

lazy_static! {
  /// Process-wide memo table for `path_derivation_modulo`, keyed by the
  /// upstream derivation's store path.
  pub(crate) static ref DRV_HASHES: Mutex<HashMap<StorePath, HashModulo>> = Default::default();
}

/// The result of hashing a derivation modulo its inputs: a single hash for
/// input-addressed derivations, one hash per output for fixed-output ones.
#[derive(Debug, Eq, PartialEq, Clone, EnumAsInner)]
pub enum HashModulo {
  Normal(Hash),
  FixedOutput(HashMap<String, Hash>),
}

#[derive(Debug, Eq, PartialEq, Clone, EnumAsInner)]
pub enum Output {
  /// The path was computed from the derivation itself.
  InputAddressed(StorePath),
  /// The output's content hash is declared up front; used for network
  /// fetches.
  Fixed(FixedOutputHash),
  /// Content-addressed, but the hash is only known after the build.
  Floating(FileIngestionMethod, HashType),
}

impl Output {
  /// The on-disk location this output will land at, if it can be known
  /// before building.
  pub fn path<S: Store + ?Sized>(
    &self,
    store: &S,
    drv_name: &str,
    output_name: &str,
  ) -> Result<Option<StorePath>> {
    match self {
      Self::InputAddressed(p) => Ok(Some(p.clone())),
      Self::Fixed(fixed) => Ok(Some(fixed_output_path(
        store,
        *fixed,
        drv_name,
        output_name,
      )?)),
      Self::Floating(_, _) => Ok(None),
    }
  }
}

pub(crate) fn fixed_output_path<S: Store + ?Sized>(
  store: &S,
  fixed: FixedOutputHash,
  drv_name: &str,
  output_name: &str,
) -> Result<StorePath> {
  store.make_fixed_output_path(
    fixed.method,
    fixed.hash,
    &output_path_name(drv_name, output_name),
    &Default::default(),
    false,
  )
}

/// `name` for the default output, `name-<id>` for the rest.
pub fn output_path_name(drv_name: impl AsRef<str>, output_name: impl AsRef<str>) -> String {
  let drv_name = drv_name.as_ref();
  let output_name = output_name.as_ref();
  if output_name == "out" {
    drv_name.to_string()
  } else {
    format!("{}-{}", drv_name, output_name)
  }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
  pub name: String,
  pub builder: PathBuf,
  pub platform: String,
  pub args: Vec<String>,
  pub env: BTreeMap<String, String>,
  pub input_sources: BTreeSet<StorePath>,
  pub outputs: BTreeMap<String, Output>,
  pub input_derivations: BTreeMap<StorePath, BTreeSet<String>>,
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub enum DerivationType {
  InputAddressed,
  Fixed,
  Floating,
}

impl DerivationType {
  pub fn is_fixed(self) -> bool {
    matches!(self, Self::Fixed)
  }

  pub fn is_content_addressed(self) -> bool {
    matches!(self, Self::Fixed | Self::Floating)
  }
}

impl Derivation {
  /// Classify the derivation, rejecting inconsistent output mixes.
  pub fn ty(&self) -> Result<DerivationType> {
    ensure!(
      !self.outputs.is_empty(),
      "derivation must have at least one output"
    );

    let mut input_addressed = 0usize;
    let mut fixed = 0usize;
    let mut floating = 0usize;
    let mut floating_type = None;

    for (name, out) in &self.outputs {
      match out {
        Output::InputAddressed(_) => input_addressed += 1,
        Output::Fixed(_) => {
          ensure!(
            name == "out",
            "fixed output must be named \"out\", not `{}'",
            name
          );
          fixed += 1;
        }
        Output::Floating(_, hash_type) => {
          floating += 1;
          match floating_type {
            None => floating_type = Some(*hash_type),
            Some(t) => ensure!(
              t == *hash_type,
              "all floating outputs must use the same hash type"
            ),
          }
        }
      }
    }

    match (input_addressed, fixed, floating) {
      (_, 0, 0) => Ok(DerivationType::InputAddressed),
      (0, 1, 0) => Ok(DerivationType::Fixed),
      (0, x, 0) if x > 1 => bail!("only one fixed output is allowed"),
      (0, 0, _) => Ok(DerivationType::Floating),
      (_, f, _) if f > 0 => bail!("non-fixed-output derivation has fixed output"),
      _ => bail!("can't mix output types in one derivation"),
    }
  }

  pub fn is_fixed_output(&self) -> bool {
    matches!(self.ty(), Ok(DerivationType::Fixed))
  }

  /// Builders named `builtin:<x>` run inside the daemon instead of being
  /// exec'd.
  pub fn is_builtin(&self) -> bool {
    self.builder.to_string_lossy().starts_with("builtin:")
  }

  pub fn find_output(&self, id: &str) -> Result<&Output> {
    self
      .outputs
      .get(id)
      .ok_or_else(|| anyhow!("derivation has no output `{}'", id))
  }

  /// Each output alongside its path, when knowable before building.
  pub fn outputs_and_opt_paths<S: Store + ?Sized>(
    &self,
    store: &S,
  ) -> Result<BTreeMap<String, (Output, Option<StorePath>)>> {
    let mut res = BTreeMap::new();
    for (name, out) in &self.outputs {
      let path = out.path(store, &self.name, name)?;
      res.insert(name.clone(), (out.clone(), path));
    }
    Ok(res)
  }
}

/// A store path qualified with the output names wanted from it, rendered
/// `path!a,b`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StorePathWithOutputs {
  pub path: StorePath,
  pub outputs: BTreeSet<String>,
}

impl StorePathWithOutputs {
  pub fn render<S: Store + ?Sized>(&self, store: &S) -> String {
    if self.outputs.is_empty() {
      store.print_store_path(&self.path)
    } else {
      format!(
        "{}!{}",
        store.print_store_path(&self.path),
        self
          .outputs
          .iter()
          .cloned()
          .collect::<Vec<_>>()
          .join(",")
      )
    }
  }
}

/// An empty wanted-set means "all outputs".
pub fn want_output(output: &str, wanted: &BTreeSet<String>) -> bool {
  wanted.is_empty() || wanted.contains(output)
}

/// An impossible path used to stand in for an output path before it is
/// known; the builder substitutes it at run time.
pub fn hash_placeholder(output_name: &str) -> String {
  format!(
    "/{}",
    Hash::hash(format!("nix-output:{}", output_name), HashType::SHA256)
      .encode(Encoding::Base32)
  )
}
