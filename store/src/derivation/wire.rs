//! The binary form used by the worker and serve protocols. Input
//! derivations are omitted; the receiving side only ever builds.

use super::parse::parse_output;
use super::{fixed_output_path, Derivation, Output};
use crate::prelude::*;
use crate::wire;
use std::io::{Read, Write};

impl Derivation {
  pub fn write_wire<S: Store + ?Sized, W: Write>(&self, store: &S, w: &mut W) -> Result<()> {
    wire::write_u64(w, self.outputs.len() as u64)?;
    for (name, out) in &self.outputs {
      wire::write_string(w, name)?;
      match out {
        Output::InputAddressed(path) => {
          wire::write_string(w, &store.print_store_path(path))?;
          wire::write_string(w, "")?;
          wire::write_string(w, "")?;
        }
        Output::Fixed(fixed) => {
          let path = fixed_output_path(store, *fixed, &self.name, name)?;
          wire::write_string(w, &store.print_store_path(&path))?;
          wire::write_string(w, &fixed.method_algo())?;
          wire::write_string(w, &fixed.hash.encode(Encoding::Base16))?;
        }
        Output::Floating(method, hash_type) => {
          wire::write_string(w, "")?;
          wire::write_string(w, &format!("{}{}", method.prefix(), hash_type))?;
          wire::write_string(w, "")?;
        }
      }
    }

    wire::write_store_paths(store, w, &self.input_sources)?;
    wire::write_string(w, &self.platform)?;
    wire::write_string(
      w,
      self
        .builder
        .to_str()
        .ok_or_else(|| anyhow!("builder path is not valid unicode"))?,
    )?;
    wire::write_strings(w, &self.args)?;

    wire::write_u64(w, self.env.len() as u64)?;
    for (key, value) in &self.env {
      wire::write_string(w, key)?;
      wire::write_string(w, value)?;
    }

    Ok(())
  }

  pub fn read_wire<S: Store + ?Sized, R: Read>(
    store: &S,
    name: String,
    r: &mut R,
  ) -> Result<Self> {
    let mut drv = Self {
      name,
      ..Default::default()
    };

    let n_outputs = wire::read_u64(r)?;
    for _ in 0..n_outputs {
      let name = wire::read_string(r)?;
      let path = wire::read_string(r)?;
      let hash_algo = wire::read_string(r)?;
      let hash = wire::read_string(r)?;
      drv
        .outputs
        .insert(name, parse_output(store, path, hash_algo, hash)?);
    }

    drv.input_sources = wire::read_store_paths(store, r)?;
    drv.platform = wire::read_string(r)?;
    drv.builder = wire::read_string(r)?.into();
    drv.args = wire::read_string_vec(r)?;

    let n_env = wire::read_u64(r)?;
    for _ in 0..n_env {
      let key = wire::read_string(r)?;
      let value = wire::read_string(r)?;
      drv.env.insert(key, value);
    }

    drv.ty()?;
    Ok(drv)
  }
}
