//! Moving store objects between stores: single-path copy with archive
//! re-hashing, and a graph-ordered parallel bulk copy that lands every
//! reference before its referrers.

use crate::prelude::*;
use crate::{ClosureOpts, Settings, Store};
use dep_queue::DependencyQueue;
use queue::Queue;
use slog_scope::{debug, error, info};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod dep_queue;
mod queue;

struct CountingWriter<W> {
  inner: W,
  total: u64,
}

impl<W: Write> Write for CountingWriter<W> {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.inner.write_all(buf)?;
    self.total += buf.len() as u64;
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    self.inner.flush()
  }
}

/// Where `info` must land in `dst`: content-addressed paths with no
/// references are renamed to the destination store's own naming.
fn destination_path(
  src: &dyn Store,
  dst: &dyn Store,
  info: &ValidPathInfo,
) -> Result<StorePath> {
  if info.ca.is_some() && info.refs.is_empty() {
    if let Some(full) = info.full_content_address()? {
      let renamed = dst.make_fixed_output_path_from_ca(&full)?;
      if dst.store_dir() == src.store_dir() {
        // same naming convention: recomputation must agree with the source
        ensure!(
          renamed == info.path,
          "path `{}' does not match its content address",
          src.print_store_path(&info.path)
        );
      }
      if renamed != info.path {
        debug!(
          "replaced path `{}' with `{}' for `{}'",
          src.print_store_path(&info.path),
          dst.print_store_path(&renamed),
          dst.uri()
        );
      }
      return Ok(renamed);
    }
  }
  Ok(info.path.clone())
}

pub fn copy_store_path(
  src: &dyn Store,
  dst: &dyn Store,
  path: &StorePath,
  repair: Repair,
  check_sigs: CheckSigs,
) -> Result<()> {
  debug!(
    "copying path `{}' from `{}' to `{}'",
    src.print_store_path(path),
    src.uri(),
    dst.uri()
  );

  let mut info = (*src.get_path_info(path)?).clone();
  info.path = destination_path(src, dst, &info)?;

  // never let the destination believe it built this itself
  info.ultimate = false;

  if info.nar_hash.is_none() {
    let mut nar = Vec::new();
    src.nar_from_path(path, &mut nar)?;

    // with a self-reference the hash must be invariant under rewriting
    // the hash part, or the destination could never verify it
    let nar_hash = if info.ca.is_some() && info.refs.has_self_reference {
      let mut sink = HashModuloSink::new(HashType::SHA256, &info.path.hash_part());
      sink.write_all(&nar)?;
      sink.finish().0
    } else {
      Hash::hash(&nar, HashType::SHA256)
    };

    info.nar_hash = Some(nar_hash);
    if info.nar_size.is_none() {
      info.nar_size = Some(nar.len() as u64);
    }

    return dst.add_to_store(&info, &mut &nar[..], repair, check_sigs);
  }

  let expected = info.nar_size;

  crossbeam::scope(|scope| -> Result<()> {
    let (read_side, write_side) = pipe()?;

    let writer = scope.spawn(move |_| -> Result<u64> {
      let mut sink = CountingWriter {
        inner: write_side,
        total: 0,
      };
      src.nar_from_path(path, &mut sink)?;
      Ok(sink.total)
    });

    let mut read_side = read_side;
    let added = dst.add_to_store(&info, &mut read_side, repair, check_sigs);
    drop(read_side);

    match (added, writer.join().unwrap()) {
      (Ok(()), _) => Ok(()),
      (Err(add_err), Ok(total)) => {
        if expected.map_or(true, |want| total < want) {
          Err(
            EndOfFile(format!(
              "NAR for `{}' fetched from `{}' is incomplete",
              src.print_store_path(path),
              src.uri()
            ))
            .into(),
          )
        } else {
          Err(add_err)
        }
      }
      (Err(add_err), Err(write_err)) => {
        let broken_pipe = write_err
          .downcast_ref::<std::io::Error>()
          .map_or(false, |e| e.kind() == std::io::ErrorKind::BrokenPipe);
        // a broken pipe just means the reader gave up first
        if broken_pipe {
          Err(add_err)
        } else {
          Err(write_err)
        }
      }
    }
  })
  .unwrap()
}

struct Node {
  info: Arc<ValidPathInfo>,
  dst_path: StorePath,
}

/// Copy `paths` from `src` to `dst`, references first, in parallel.
/// Returns the source-to-destination path mapping, which differs from the
/// identity only for renamed content-addressed paths.
pub fn copy_paths(
  src: &dyn Store,
  dst: &dyn Store,
  paths: &StorePathSet,
  repair: Repair,
  check_sigs: CheckSigs,
  substitute: Substitute,
) -> Result<BTreeMap<StorePath, StorePath>> {
  let valid = dst.query_valid_paths(paths, substitute)?;

  let mut paths_map = paths
    .iter()
    .map(|p| (p.clone(), p.clone()))
    .collect::<BTreeMap<_, _>>();

  let missing = paths
    .iter()
    .filter(|p| !valid.contains(*p))
    .cloned()
    .collect::<Vec<_>>();
  if missing.is_empty() {
    return Ok(paths_map);
  }

  info!("copying {} paths to `{}'", missing.len(), dst.uri());

  let nr_done = AtomicUsize::new(0);
  let nr_failed = AtomicUsize::new(0);
  let nr_running = AtomicUsize::new(0);
  let bytes_expected = AtomicU64::new(0);

  // expand: walk the reference graph from the missing roots, deciding per
  // node whether the destination already has it
  let mut nodes = HashMap::<StorePath, Option<Node>>::new();
  let mut to_visit = missing.clone();
  while let Some(path) = to_visit.pop() {
    if nodes.contains_key(&path) {
      continue;
    }
    check_interrupt()?;

    let info = src.get_path_info(&path)?;
    let dst_path = destination_path(src, dst, &info)?;
    paths_map.insert(path.clone(), dst_path.clone());

    if dst.is_valid_path(&dst_path)? {
      nr_done.fetch_add(1, Ordering::Relaxed);
      nodes.insert(path, None);
      continue;
    }

    bytes_expected.fetch_add(info.nar_size.unwrap_or(0), Ordering::Relaxed);
    to_visit.extend(info.refs.references.iter().cloned());
    nodes.insert(path, Some(Node { info, dst_path }));
  }

  debug!(
    "{} paths to copy, {} bytes expected",
    nodes.values().filter(|n| n.is_some()).count(),
    bytes_expected.load(Ordering::Relaxed)
  );

  // build the dependency queue; only edges to nodes we will actually copy
  let mut graph = DependencyQueue::<StorePath, Node>::default();
  for (path, node) in &nodes {
    if let Some(node) = node {
      let deps = node
        .info
        .refs
        .references
        .iter()
        .filter(|r| matches!(nodes.get(*r), Some(Some(_))))
        .cloned()
        .collect::<Vec<_>>();
      graph.enqueue(
        path.clone(),
        Node {
          info: Arc::clone(&node.info),
          dst_path: node.dst_path.clone(),
        },
        deps,
      );
    }
  }
  graph.queue_finished();

  let total = graph.len();
  let ready = Queue::<(StorePath, Node)>::new();
  let finished = Queue::<(StorePath, Result<()>)>::new();
  let stop = AtomicBool::new(false);

  let workers = std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
    .min(total.max(1));

  let first_error = crossbeam::scope(|scope| {
    for _ in 0..workers {
      scope.spawn(|_| loop {
        let (path, node) = match ready.pop(Duration::from_millis(50)) {
          Some(job) => job,
          None => {
            if stop.load(Ordering::SeqCst) {
              break;
            }
            continue;
          }
        };

        let result = (|| -> Result<()> {
          check_interrupt()?;
          // another worker may have raced us here
          if dst.is_valid_path(&node.dst_path)? {
            return Ok(());
          }
          nr_running.fetch_add(1, Ordering::Relaxed);
          let res = copy_store_path(src, dst, &path, repair, check_sigs);
          nr_running.fetch_sub(1, Ordering::Relaxed);
          res
        })();

        finished.push((path, result));
      });
    }

    // driver: feed ready nodes to the workers, release dependants as
    // their dependencies land
    let mut first_error = None;

    while let Some((path, node)) = graph.dequeue() {
      ready.push((path, node));
    }

    let mut outstanding = total;
    while outstanding > 0 {
      let (path, result) = match finished.pop(Duration::from_millis(500)) {
        Some(msg) => msg,
        None => continue,
      };
      outstanding -= 1;

      match result {
        Ok(()) => {
          nr_done.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
          nr_failed.fetch_add(1, Ordering::Relaxed);
          if !Settings::get().keep_going() {
            first_error = Some(e);
            break;
          }
          error!("could not copy {}: {:#}", src.print_store_path(&path), e);
        }
      }

      debug!(
        "copy progress";
        "done" => nr_done.load(Ordering::Relaxed),
        "total" => total,
        "running" => nr_running.load(Ordering::Relaxed),
        "failed" => nr_failed.load(Ordering::Relaxed)
      );

      graph.finish(&path);
      while let Some((next, node)) = graph.dequeue() {
        ready.push((next, node));
      }
    }

    stop.store(true, Ordering::SeqCst);
    first_error
  })
  .unwrap();

  if let Some(e) = first_error {
    return Err(e);
  }

  Ok(paths_map)
}

/// Copy the full forward closure of `paths`.
pub fn copy_closure(
  src: &dyn Store,
  dst: &dyn Store,
  paths: &StorePathSet,
  repair: Repair,
  check_sigs: CheckSigs,
  substitute: Substitute,
) -> Result<BTreeMap<StorePath, StorePath>> {
  let mut closure = StorePathSet::new();
  src.compute_fs_closure(paths, &mut closure, ClosureOpts::default())?;
  copy_paths(src, dst, &closure, repair, check_sigs, substitute)
}
