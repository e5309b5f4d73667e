use super::{fixed_output_path, Derivation, Output};
use crate::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

pub type OverrideInputs = Option<BTreeMap<String, BTreeSet<String>>>;

impl Derivation {
  /// A `Display` adapter producing the textual form. With `mask_outputs`,
  /// output paths and env vars named after outputs are emitted empty, so
  /// the result is independent of yet-unknown output paths. When
  /// `override_inputs` is given it replaces the input-derivation list
  /// verbatim; hashing modulo substitutes upstream hashes this way.
  pub fn print<'drv, S: Store + ?Sized>(
    &'drv self,
    store: &'drv S,
    mask_outputs: bool,
    override_inputs: OverrideInputs,
  ) -> Print<'drv, S> {
    Print {
      store,
      drv: self,
      mask_outputs,
      override_inputs,
    }
  }
}

/// `"..."` with no escapes; for strings known to contain none.
struct Raw<T>(T);

impl<T: Display> Display for Raw<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "\"{}\"", self.0)
  }
}

/// C-style quoting; only `\n \r \t \\ \"` are ever emitted.
struct Quoted<T>(T);

impl<T: Display> Display for Quoted<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("\"")?;
    for ch in self.0.to_string().chars() {
      match ch {
        '"' | '\\' => write!(f, "\\{}", ch)?,
        '\n' => f.write_str("\\n")?,
        '\r' => f.write_str("\\r")?,
        '\t' => f.write_str("\\t")?,
        _ => write!(f, "{}", ch)?,
      }
    }
    f.write_str("\"")
  }
}

pub struct Print<'drv, S: Store + ?Sized + 'drv> {
  store: &'drv S,
  drv: &'drv Derivation,
  mask_outputs: bool,
  override_inputs: OverrideInputs,
}

fn raw_list<T: Display>(
  f: &mut fmt::Formatter<'_>,
  items: impl IntoIterator<Item = T>,
) -> fmt::Result {
  f.write_str("[")?;
  for (ix, item) in items.into_iter().enumerate() {
    if ix > 0 {
      f.write_str(",")?;
    }
    write!(f, "{}", Raw(item))?;
  }
  f.write_str("]")
}

impl<'drv, S: Store + ?Sized + 'drv> Display for Print<'drv, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("Derive([")?;

    for (ix, (name, out)) in self.drv.outputs.iter().enumerate() {
      if ix > 0 {
        f.write_str(",")?;
      }
      write!(f, "({}", Raw(name))?;
      match out {
        Output::InputAddressed(path) => {
          let path = if self.mask_outputs {
            String::new()
          } else {
            self.store.print_store_path(path)
          };
          write!(f, ",{},\"\",\"\"", Raw(path))?;
        }
        Output::Fixed(fixed) => {
          let path = if self.mask_outputs {
            String::new()
          } else {
            let p = fixed_output_path(self.store, *fixed, &self.drv.name, name)
              .map_err(|_| fmt::Error)?;
            self.store.print_store_path(&p)
          };
          write!(
            f,
            ",{},{},{}",
            Raw(path),
            Raw(fixed.method_algo()),
            Raw(fixed.hash.encode(Encoding::Base16))
          )?;
        }
        Output::Floating(method, hash_type) => {
          write!(f, ",\"\",{},\"\"", Raw(format!("{}{}", method.prefix(), hash_type)))?;
        }
      }
      f.write_str(")")?;
    }

    f.write_str("],[")?;

    if let Some(actual) = &self.override_inputs {
      for (ix, (key, outs)) in actual.iter().enumerate() {
        if ix > 0 {
          f.write_str(",")?;
        }
        write!(f, "({},", Raw(key))?;
        raw_list(f, outs)?;
        f.write_str(")")?;
      }
    } else {
      for (ix, (path, outs)) in self.drv.input_derivations.iter().enumerate() {
        if ix > 0 {
          f.write_str(",")?;
        }
        write!(f, "({},", Raw(self.store.print_store_path(path)))?;
        raw_list(f, outs)?;
        f.write_str(")")?;
      }
    }

    f.write_str("],")?;

    let sources = self
      .drv
      .input_sources
      .iter()
      .map(|p| self.store.print_store_path(p))
      .collect::<BTreeSet<_>>();
    raw_list(f, &sources)?;

    write!(
      f,
      ",{},{},[",
      Raw(&self.drv.platform),
      Quoted(self.drv.builder.display())
    )?;

    for (ix, arg) in self.drv.args.iter().enumerate() {
      if ix > 0 {
        f.write_str(",")?;
      }
      write!(f, "{}", Quoted(arg))?;
    }
    f.write_str("],[")?;

    for (ix, (key, value)) in self.drv.env.iter().enumerate() {
      if ix > 0 {
        f.write_str(",")?;
      }
      let value = if self.mask_outputs && self.drv.outputs.contains_key(key) {
        ""
      } else {
        value
      };
      write!(f, "({},{})", Quoted(key), Quoted(value))?;
    }

    f.write_str("])")
  }
}
