//! The archive byte-stream codec: a deterministic serialisation of a
//! filesystem subtree. Strings are length-prefixed (u64 little-endian)
//! and padded to 8-byte boundaries.

use crate::*;
use nix::fcntl;
use nix::libc::{S_IXGRP, S_IXOTH, S_IXUSR};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

const VERSION_MAGIC: &str = "nix-archive-1";

pub struct PathFilter(Box<dyn Fn(&Path) -> Result<bool> + Send + Sync>);

impl PathFilter {
  pub fn new<F: Fn(&Path) -> Result<bool> + Send + Sync + 'static>(f: F) -> Self {
    Self(Box::new(f))
  }

  pub fn none() -> Self {
    Self(Box::new(|_| Ok(true)))
  }
}

struct Source<R> {
  reader: R,
}

impl<R: Read> Source<R> {
  fn read_u64(&mut self) -> Result<u64> {
    let mut buf = [0u8; 8];
    self.reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
  }

  fn read_padding(&mut self, len: u64) -> Result<()> {
    if len % 8 > 0 {
      let mut padding = vec![0u8; (8 - len % 8) as usize];
      self.reader.read_exact(&mut padding)?;
      ensure!(padding.iter().all(|x| *x == 0), "non-zero padding");
    }
    Ok(())
  }

  fn read_tag_sized(&mut self, max_len: usize) -> Result<Vec<u8>> {
    let len = self.read_u64()?;
    ensure!(
      len <= max_len as u64,
      "input string is too long (max {}, got {})",
      max_len,
      len
    );
    let mut data = vec![0u8; len as usize];
    self.reader.read_exact(&mut data)?;
    self.read_padding(len)?;
    Ok(data)
  }

  fn read_tag(&mut self) -> Result<Vec<u8>> {
    self.read_tag_sized(usize::MAX)
  }
}

struct Sink<W> {
  writer: W,
}

impl<W: Write> Sink<W> {
  fn write_u64(&mut self, n: u64) -> Result<()> {
    self.writer.write_all(&n.to_le_bytes())?;
    Ok(())
  }

  fn pad(&mut self, len: u64) -> Result<()> {
    if len % 8 > 0 {
      let zeroes = vec![0u8; (8 - len % 8) as usize];
      self.writer.write_all(&zeroes)?;
    }
    Ok(())
  }

  fn tag(&mut self, tag: &str) -> Result<()> {
    self.write_u64(tag.len() as u64)?;
    self.writer.write_all(tag.as_bytes())?;
    self.pad(tag.len() as u64)
  }

  fn tags<'a>(&mut self, tags: impl IntoIterator<Item = &'a str>) -> Result<()> {
    for t in tags {
      self.tag(t)?;
    }
    Ok(())
  }

  fn receive<R: Read>(&mut self, len: u64, reader: &mut R) -> Result<()> {
    self.write_u64(len)?;
    let copied = io::copy(&mut reader.take(len), &mut self.writer)?;
    ensure!(copied == len, "short read while archiving contents");
    self.pad(len)
  }
}

pub fn dump_path<P: AsRef<Path>, W: Write>(path: P, sink: W, filter: &PathFilter) -> Result<()> {
  let mut sink = Sink { writer: sink };
  sink.tag(VERSION_MAGIC)?;
  do_dump(&mut sink, path.as_ref(), filter)
}

pub fn dump_string<W: Write>(contents: &str, sink: W) -> Result<()> {
  dump_bytes(contents.len() as u64, &mut contents.as_bytes(), sink)
}

/// Archive a single regular file whose contents come from `source`.
pub fn dump_bytes<R: Read, W: Write>(len: u64, mut source: R, sink: W) -> Result<()> {
  let mut sink = Sink { writer: sink };
  sink.tags([VERSION_MAGIC, "(", "type", "regular", "contents"])?;
  sink.receive(len, &mut source)?;
  sink.tag(")")
}

fn do_dump<W: Write>(sink: &mut Sink<W>, path: &Path, filter: &PathFilter) -> Result<()> {
  let meta = fs::symlink_metadata(path)?;
  let ty = meta.file_type();

  sink.tag("(")?;

  if ty.is_file() {
    sink.tags(["type", "regular"])?;
    if meta.mode() & S_IXUSR != 0 {
      sink.tags(["executable", ""])?;
    }
    sink.tag("contents")?;
    sink.receive(meta.len(), &mut File::open(path)?)?;
  } else if ty.is_dir() {
    sink.tags(["type", "directory"])?;
    // entries must appear in strictly increasing name order
    let mut entries = BTreeMap::new();
    for entry in fs::read_dir(path)? {
      let entry = entry?;
      let name = entry
        .file_name()
        .into_string()
        .map_err(|n| anyhow!("entry name {:?} is not valid unicode", n))?;
      entries.insert(name, ());
    }

    for name in entries.keys() {
      let child = path.join(name);
      if (filter.0)(&child)? {
        sink.tags(["entry", "(", "name", name, "node"])?;
        do_dump(sink, &child, filter)?;
        sink.tag(")")?;
      }
    }
  } else if ty.is_symlink() {
    let target = fs::read_link(path)?;
    sink.tags(["type", "symlink", "target"])?;
    sink.tag(
      target
        .to_str()
        .ok_or_else(|| anyhow!("symlink target is not valid unicode"))?,
    )?;
  } else {
    bail!("file `{}' has an unsupported type", path.display());
  }

  sink.tag(")")
}

pub fn restore_path<P: AsRef<Path>, R: Read>(path: P, source: R) -> Result<()> {
  let mut src = Source { reader: source };
  let version = src.read_tag_sized(VERSION_MAGIC.len())?;
  ensure!(version == VERSION_MAGIC.as_bytes(), "input is not an archive");
  do_restore(&mut src, path.as_ref())
}

fn do_restore<R: Read>(src: &mut Source<R>, path: &Path) -> Result<()> {
  #[derive(Eq, PartialEq)]
  enum NodeType {
    Unknown,
    File,
    Dir,
    Link,
  }

  let mut cur_type = NodeType::Unknown;
  let mut cur_file = None;

  ensure!(src.read_tag()? == b"(", "bad open tag");

  loop {
    let tag = src.read_tag()?;

    match &tag[..] {
      b")" => break,
      b"type" => {
        ensure!(cur_type == NodeType::Unknown, "multiple type fields");
        match src.read_tag()?.as_slice() {
          b"regular" => {
            cur_type = NodeType::File;
            cur_file = Some(File::create(path)?);
          }
          b"directory" => {
            cur_type = NodeType::Dir;
            fs::create_dir(path)?;
          }
          b"symlink" => {
            cur_type = NodeType::Link;
          }
          x => bail!("unrecognized entry type {:?}", String::from_utf8_lossy(x)),
        }
      }
      b"contents" if cur_type == NodeType::File => {
        let len = src.read_u64()?;
        let file = cur_file
          .as_mut()
          .ok_or_else(|| anyhow!("contents without a current file"))?;

        if len > 0 {
          fcntl::posix_fallocate(file.as_raw_fd(), 0, len as i64)?;
        }

        let copied = io::copy(&mut (&mut src.reader).take(len), file)?;
        ensure!(copied == len, "archive contents truncated");
        file.flush()?;

        src.read_padding(len)?;
      }
      b"executable" if cur_type == NodeType::File => {
        ensure!(
          src.read_tag()?.is_empty(),
          "executable marker should be empty"
        );
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | S_IXUSR | S_IXGRP | S_IXOTH);
        fs::set_permissions(path, perms)?;
      }
      b"entry" if cur_type == NodeType::Dir => {
        let mut name = String::new();
        let mut prev_name = String::new();

        ensure!(src.read_tag()? == b"(", "expected open tag");

        loop {
          match src.read_tag()?.as_slice() {
            b")" => break,
            b"name" => {
              name = String::from_utf8_lossy(&src.read_tag()?).to_string();
              if name.is_empty()
                || name == "."
                || name == ".."
                || name.contains('/')
                || name.contains('\x00')
              {
                bail!("archive contains invalid file name `{}'", name);
              }
              ensure!(name > prev_name, "archive entries are out of order");
              prev_name = name.clone();
            }
            b"node" => {
              ensure!(!name.is_empty(), "entry name missing");
              do_restore(src, &path.join(&name))?;
            }
            x => bail!("unknown field {:?}", String::from_utf8_lossy(x)),
          }
        }
      }
      b"target" if cur_type == NodeType::Link => {
        let target = src.read_tag()?;
        symlink(&*String::from_utf8_lossy(&target), path)?;
      }
      x => bail!("unknown field {:?}", String::from_utf8_lossy(x)),
    }
  }

  Ok(())
}

struct Tee<R, W> {
  reader: R,
  writer: W,
}

impl<R: Read, W: Write> Read for Tee<R, W> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let n = self.reader.read(buf)?;
    self.writer.write_all(&buf[..n])?;
    Ok(n)
  }
}

/// Copy exactly one archive from `reader` to `writer`, validating the
/// structure on the way so the caller knows where the archive ends.
pub fn copy_nar<R: Read, W: Write>(reader: R, writer: W) -> Result<()> {
  let mut src = Source {
    reader: Tee { reader, writer },
  };
  let version = src.read_tag_sized(VERSION_MAGIC.len())?;
  ensure!(version == VERSION_MAGIC.as_bytes(), "input is not an archive");
  drain_node(&mut src)
}

fn drain_node<T: Read>(src: &mut Source<T>) -> Result<()> {
  ensure!(src.read_tag()? == b"(", "bad open tag");

  loop {
    let tag = src.read_tag()?;
    match &tag[..] {
      b")" => break,
      b"type" | b"target" | b"executable" => {
        src.read_tag()?;
      }
      b"contents" => {
        let len = src.read_u64()?;
        let copied = io::copy(&mut (&mut src.reader).take(len), &mut io::sink())?;
        ensure!(copied == len, "archive contents truncated");
        src.read_padding(len)?;
      }
      b"entry" => {
        ensure!(src.read_tag()? == b"(", "expected open tag");
        loop {
          match src.read_tag()?.as_slice() {
            b")" => break,
            b"name" => {
              src.read_tag()?;
            }
            b"node" => drain_node(src)?,
            x => bail!("unknown field {:?}", String::from_utf8_lossy(x)),
          }
        }
      }
      x => bail!("unknown field {:?}", String::from_utf8_lossy(x)),
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn string_archive_roundtrip() {
    let mut nar = Vec::new();
    dump_string("hello world", &mut nar).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out");
    restore_path(&dest, Cursor::new(&nar)).unwrap();
    assert_eq!(fs::read_to_string(&dest).unwrap(), "hello world");
  }

  #[test]
  fn tree_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tree");
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("a"), "alpha").unwrap();
    fs::write(root.join("sub/b"), "beta").unwrap();
    symlink("a", root.join("link")).unwrap();

    let mut nar = Vec::new();
    dump_path(&root, &mut nar, &PathFilter::none()).unwrap();

    let dest = dir.path().join("copy");
    restore_path(&dest, Cursor::new(&nar)).unwrap();

    assert_eq!(fs::read_to_string(dest.join("a")).unwrap(), "alpha");
    assert_eq!(fs::read_to_string(dest.join("sub/b")).unwrap(), "beta");
    assert_eq!(fs::read_link(dest.join("link")).unwrap(), Path::new("a"));

    let mut nar2 = Vec::new();
    dump_path(&dest, &mut nar2, &PathFilter::none()).unwrap();
    assert_eq!(nar, nar2);
  }

  #[test]
  fn copy_nar_stops_at_archive_end() {
    let mut nar = Vec::new();
    dump_string("payload", &mut nar).unwrap();

    let mut stream = nar.clone();
    stream.extend_from_slice(b"TRAILING");

    let mut copied = Vec::new();
    let mut cursor = Cursor::new(&stream);
    copy_nar(&mut cursor, &mut copied).unwrap();
    assert_eq!(copied, nar);
    assert_eq!(cursor.position() as usize, nar.len());
  }
}
