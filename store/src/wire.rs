//! Worker-protocol framing: unsigned 64-bit little-endian integers,
//! length-prefixed strings padded to 8 bytes, lists as count + elements.

use crate::prelude::*;
use std::io::{Read, Write};

const MAX_STRING: u64 = 0x4000000;

pub fn write_u64<W: Write>(w: &mut W, n: u64) -> Result<()> {
  w.write_all(&n.to_le_bytes())?;
  Ok(())
}

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
  let mut buf = [0u8; 8];
  r.read_exact(&mut buf).map_err(map_eof)?;
  Ok(u64::from_le_bytes(buf))
}

pub fn write_bool<W: Write>(w: &mut W, b: bool) -> Result<()> {
  write_u64(w, b as u64)
}

pub fn read_bool<R: Read>(r: &mut R) -> Result<bool> {
  Ok(read_u64(r)? != 0)
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
  write_bytes(w, s.as_bytes())
}

pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
  write_u64(w, bytes.len() as u64)?;
  w.write_all(bytes)?;
  if bytes.len() % 8 > 0 {
    w.write_all(&[0u8; 8][..8 - bytes.len() % 8])?;
  }
  Ok(())
}

pub fn read_string<R: Read>(r: &mut R) -> Result<String> {
  Ok(String::from_utf8(read_bytes(r)?)?)
}

pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
  let len = read_u64(r)?;
  ensure!(len <= MAX_STRING, "string of length {} is too long", len);
  let mut data = vec![0u8; len as usize];
  r.read_exact(&mut data).map_err(map_eof)?;
  if len % 8 > 0 {
    let mut pad = vec![0u8; (8 - len % 8) as usize];
    r.read_exact(&mut pad).map_err(map_eof)?;
    ensure!(pad.iter().all(|b| *b == 0), "non-zero padding");
  }
  Ok(data)
}

pub fn write_strings<W: Write, S: AsRef<str>>(
  w: &mut W,
  items: impl IntoIterator<Item = S>,
) -> Result<()> {
  let items = items.into_iter().collect::<Vec<_>>();
  write_u64(w, items.len() as u64)?;
  for item in items {
    write_string(w, item.as_ref())?;
  }
  Ok(())
}

pub fn read_string_vec<R: Read>(r: &mut R) -> Result<Vec<String>> {
  let n = read_u64(r)?;
  (0..n).map(|_| read_string(r)).collect()
}

pub fn read_string_set<R: Read>(r: &mut R) -> Result<std::collections::BTreeSet<String>> {
  let n = read_u64(r)?;
  (0..n).map(|_| read_string(r)).collect()
}

pub fn write_store_paths<S: Store + ?Sized, W: Write>(
  store: &S,
  w: &mut W,
  paths: &StorePathSet,
) -> Result<()> {
  write_strings(w, paths.iter().map(|p| store.print_store_path(p)))
}

pub fn read_store_paths<S: Store + ?Sized, R: Read>(
  store: &S,
  r: &mut R,
) -> Result<StorePathSet> {
  let n = read_u64(r)?;
  (0..n)
    .map(|_| {
      let s = read_string(r)?;
      store.parse_store_path(std::path::Path::new(&s))
    })
    .collect()
}

fn map_eof(e: std::io::Error) -> anyhow::Error {
  if e.kind() == std::io::ErrorKind::UnexpectedEof {
    EndOfFile("unexpected end of file reading from remote".into()).into()
  } else {
    e.into()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn string_framing_pads_to_eight() {
    let mut buf = Vec::new();
    write_string(&mut buf, "abc").unwrap();
    // 8 length bytes + 3 content + 5 padding
    assert_eq!(buf.len(), 16);
    assert_eq!(&buf[..8], &3u64.to_le_bytes());
    assert_eq!(&buf[8..11], b"abc");
    assert!(buf[11..].iter().all(|b| *b == 0));

    assert_eq!(read_string(&mut Cursor::new(&buf)).unwrap(), "abc");
  }

  #[test]
  fn string_list_roundtrip() {
    let mut buf = Vec::new();
    write_strings(&mut buf, ["one", "two", "three"]).unwrap();
    assert_eq!(
      read_string_vec(&mut Cursor::new(&buf)).unwrap(),
      vec!["one", "two", "three"]
    );
  }

  #[test]
  fn short_reads_are_end_of_file() {
    let mut buf = Vec::new();
    write_string(&mut buf, "truncated").unwrap();
    buf.truncate(10);
    let err = read_string(&mut Cursor::new(&buf)).unwrap_err();
    assert!(err.downcast_ref::<EndOfFile>().is_some());
  }
}
