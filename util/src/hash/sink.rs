use super::{Context, Hash, HashType};
use std::io::{self, Write};

/// A writer that hashes everything passing through it on the way to
/// `writer`.
pub struct Sink<W> {
  ctx: Context,
  writer: W,
}

impl<W> Sink<W> {
  pub fn new(ty: HashType, writer: W) -> Self {
    Self {
      ctx: Context::new(ty),
      writer,
    }
  }

  pub fn finish(self) -> (W, Hash, u64) {
    let (hash, len) = self.ctx.finish();
    (self.writer, hash, len)
  }
}

impl<W: Write> Write for Sink<W> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.ctx.input(buf);
    self.writer.write_all(buf)?;
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.writer.flush()
  }
}

/// Hashes a stream modulo occurrences of a modulus string, typically a
/// store path's hash part. Occurrences are replaced by NULs and their
/// offsets appended to the digest, so the result is invariant under
/// rewriting the modulus to another value of the same length.
pub struct ModuloSink {
  ctx: Context,
  pattern: Vec<u8>,
  tail: Vec<u8>,
  matches: Vec<u64>,
  base: u64,
  raw_len: u64,
}

impl ModuloSink {
  pub fn new(ty: HashType, modulus: &str) -> Self {
    assert!(!modulus.is_empty());
    Self {
      ctx: Context::new(ty),
      pattern: modulus.as_bytes().to_vec(),
      tail: Vec::new(),
      matches: Vec::new(),
      base: 0,
      raw_len: 0,
    }
  }

  pub fn finish(mut self) -> (Hash, u64) {
    let tail = std::mem::take(&mut self.tail);
    self.ctx.input(&tail);
    for pos in &self.matches {
      self.ctx.input(format!("|{}", pos).as_bytes());
    }
    let (hash, _) = self.ctx.finish();
    (hash, self.raw_len)
  }
}

impl Write for ModuloSink {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.raw_len += buf.len() as u64;

    let mut data = std::mem::take(&mut self.tail);
    data.extend_from_slice(buf);

    let plen = self.pattern.len();
    if data.len() < plen {
      self.tail = data;
      return Ok(buf.len());
    }

    let mut i = 0;
    while i + plen <= data.len() {
      if data[i..i + plen] == self.pattern[..] {
        self.matches.push(self.base + i as u64);
        data[i..i + plen].iter_mut().for_each(|b| *b = 0);
        i += plen;
      } else {
        i += 1;
      }
    }

    // hold back one potential partial match across the chunk boundary
    let split = data.len() - (plen - 1).min(data.len());
    self.ctx.input(&data[..split]);
    self.tail = data.split_off(split);
    self.base += split as u64;

    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_sink_hashes_passthrough() {
    let mut sink = Sink::new(HashType::SHA256, Vec::new());
    sink.write_all(b"hello ").unwrap();
    sink.write_all(b"world").unwrap();
    let (buf, hash, len) = sink.finish();
    assert_eq!(buf, b"hello world");
    assert_eq!(len, 11);
    assert_eq!(hash, Hash::hash("hello world", HashType::SHA256));
  }

  #[test]
  fn modulo_masks_occurrences() {
    let modulus = "abcdef";
    let mut sink = ModuloSink::new(HashType::SHA256, modulus);
    // split writes mid-pattern to exercise the boundary carry
    sink.write_all(b"xxabc").unwrap();
    sink.write_all(b"defyyabcdef").unwrap();
    let (hash, len) = sink.finish();
    assert_eq!(len, 16);

    let mut expected = Context::new(HashType::SHA256);
    expected.input(b"xx\0\0\0\0\0\0yy\0\0\0\0\0\0");
    expected.input(b"|2");
    expected.input(b"|10");
    assert_eq!(hash, expected.finish().0);
  }

  #[test]
  fn modulo_without_occurrence_differs_only_by_markers() {
    let mut sink = ModuloSink::new(HashType::SHA256, "zzzz");
    sink.write_all(b"plain data").unwrap();
    let (hash, len) = sink.finish();
    assert_eq!(len, 10);
    assert_eq!(hash, Hash::hash("plain data", HashType::SHA256));
  }
}
