//! Streaming descent over the textual derivation form:
//! `Derive([outputs],[input drvs],[input srcs],platform,builder,[args],[env])`.

use super::{Derivation, Output};
use crate::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;

impl Derivation {
  pub fn parse<S: Store + ?Sized, C: AsRef<str>>(
    store: &S,
    name: String,
    contents: C,
  ) -> Result<Self> {
    let mut drv = Self {
      name,
      ..Default::default()
    };
    let mut parser = Parser::new(contents.as_ref());

    parser.expect("Derive([")?;

    let mut first = true;
    while !parser.end_of_list(&mut first)? {
      parser.expect("(")?;
      let id = parser.string()?;
      parser.expect(",")?;
      let path = parser.string()?;
      parser.expect(",")?;
      let hash_algo = parser.string()?;
      parser.expect(",")?;
      let hash = parser.string()?;
      parser.expect(")")?;

      drv
        .outputs
        .insert(id, parse_output(store, path, hash_algo, hash)?);
    }

    parser.expect(",[")?;
    let mut first = true;
    while !parser.end_of_list(&mut first)? {
      parser.expect("(")?;
      let drv_path = parser.path()?;
      parser.expect(",[")?;
      let outputs = parser.strings()?;
      parser.expect(")")?;
      drv
        .input_derivations
        .insert(store.parse_store_path(Path::new(&drv_path))?, outputs);
    }

    parser.expect(",[")?;
    drv.input_sources = parser
      .paths()?
      .into_iter()
      .map(|p| store.parse_store_path(Path::new(&p)))
      .collect::<Result<BTreeSet<_>>>()?;

    parser.expect(",")?;
    drv.platform = parser.string()?;

    parser.expect(",")?;
    drv.builder = parser.string()?.into();

    parser.expect(",[")?;
    let mut first = true;
    while !parser.end_of_list(&mut first)? {
      drv.args.push(parser.string()?);
    }

    parser.expect(",[")?;
    let mut first = true;
    while !parser.end_of_list(&mut first)? {
      parser.expect("(")?;
      let name = parser.string()?;
      parser.expect(",")?;
      let value = parser.string()?;
      parser.expect(")")?;
      drv.env.insert(name, value);
    }

    parser.expect(")")?;

    // force the type discipline on everything we hand out
    drv.ty()?;
    Ok(drv)
  }
}

pub(crate) fn parse_output<S: Store + ?Sized>(
  store: &S,
  path: String,
  hash_algo: String,
  hash: String,
) -> Result<Output> {
  if !hash_algo.is_empty() {
    let (method, algo) = if let Some(rest) = hash_algo.strip_prefix("r:") {
      (FileIngestionMethod::Recursive, rest)
    } else if let Some(rest) = hash_algo.strip_prefix("git:") {
      (FileIngestionMethod::Git, rest)
    } else {
      (FileIngestionMethod::Flat, &*hash_algo)
    };
    let hash_type = algo.parse::<HashType>()?;
    if !hash.is_empty() {
      ensure!(
        Path::new(&path).starts_with("/"),
        "fixed output path `{}' is invalid",
        path
      );
      Ok(Output::Fixed(FixedOutputHash {
        method,
        hash: Hash::decode_with_type(&hash, hash_type, false)?,
      }))
    } else {
      ensure!(
        path.is_empty(),
        "floating content-addressed output path must be empty"
      );
      Ok(Output::Floating(method, hash_type))
    }
  } else {
    ensure!(
      hash.is_empty(),
      "non-fixed-output derivation has fixed output"
    );
    ensure!(
      Path::new(&path).starts_with("/"),
      "output path `{}' is invalid",
      path
    );
    Ok(Output::InputAddressed(
      store.parse_store_path(Path::new(&path))?,
    ))
  }
}

struct Parser<'input> {
  input: &'input str,
  pos: usize,
}

type ParseResult<T> = std::result::Result<T, FormatError>;

impl<'input> Parser<'input> {
  fn new(input: &'input str) -> Self {
    Self { input, pos: 0 }
  }

  fn rest(&self) -> &'input str {
    &self.input[self.pos..]
  }

  fn expect(&mut self, literal: &str) -> ParseResult<()> {
    if self.rest().starts_with(literal) {
      self.pos += literal.len();
      Ok(())
    } else {
      self.err(ErrorKind::Expected(literal.into()))
    }
  }

  fn next(&mut self) -> ParseResult<char> {
    match self.rest().chars().next() {
      Some(c) => {
        self.pos += c.len_utf8();
        Ok(c)
      }
      None => self.err(ErrorKind::UnexpectedEof),
    }
  }

  fn string(&mut self) -> ParseResult<String> {
    self.expect("\"")?;
    let mut buf = String::new();
    loop {
      match self.next()? {
        '"' => break Ok(buf),
        '\\' => match self.next()? {
          'n' => buf.push('\n'),
          'r' => buf.push('\r'),
          't' => buf.push('\t'),
          c => buf.push(c),
        },
        c => buf.push(c),
      }
    }
  }

  fn path(&mut self) -> ParseResult<String> {
    let s = self.string()?;
    if s.starts_with('/') {
      Ok(s)
    } else {
      self.err(ErrorKind::InvalidPath)
    }
  }

  fn strings(&mut self) -> ParseResult<BTreeSet<String>> {
    let mut res = BTreeSet::new();
    let mut first = true;
    while !self.end_of_list(&mut first)? {
      res.insert(self.string()?);
    }
    Ok(res)
  }

  fn paths(&mut self) -> ParseResult<BTreeSet<String>> {
    let mut res = BTreeSet::new();
    let mut first = true;
    while !self.end_of_list(&mut first)? {
      res.insert(self.path()?);
    }
    Ok(res)
  }

  /// Consume a list separator. At the head of a list any element may
  /// follow directly; after an element, anything other than `,` or `]` is
  /// garbage, not a "keep going" signal; looping on it would never
  /// terminate.
  fn end_of_list(&mut self, first: &mut bool) -> ParseResult<bool> {
    let at_head = std::mem::replace(first, false);
    match self.rest().chars().next() {
      Some(']') => {
        self.pos += 1;
        Ok(true)
      }
      Some(',') if !at_head => {
        self.pos += 1;
        Ok(false)
      }
      Some(_) if at_head => Ok(false),
      Some(_) => self.err(ErrorKind::Expected("`,' or `]'".into())),
      None => self.err(ErrorKind::UnexpectedEof),
    }
  }

  fn err<T>(&self, kind: ErrorKind) -> ParseResult<T> {
    Err(FormatError {
      at: self.rest().chars().take(32).collect(),
      kind,
    })
  }
}

/// Malformed derivation text or a truncated stream.
#[derive(Debug, Display, Error)]
#[display(fmt = "{}, at `{}'", kind, at)]
pub struct FormatError {
  at: String,
  kind: ErrorKind,
}

#[derive(Debug, Display)]
enum ErrorKind {
  #[display(fmt = "expected {}", _0)]
  Expected(String),
  #[display(fmt = "path must start with `/'")]
  InvalidPath,
  #[display(fmt = "unexpected end of input")]
  UnexpectedEof,
}
