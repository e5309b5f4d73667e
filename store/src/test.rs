//! Shared scaffolding for the crate's tests: throwaway local stores and a
//! backend wrapper that counts uncached queries.

use crate::cache::PathInfoCache;
use crate::local::LocalStore;
use crate::prelude::*;
use crate::uri::StoreParams;
use crate::Callback;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) fn test_store() -> (tempfile::TempDir, LocalStore) {
  let dir = tempfile::tempdir().unwrap();
  let mut params = StoreParams::new();
  params.insert("root".into(), dir.path().display().to_string());
  let store = LocalStore::open(&params).unwrap();
  (dir, store)
}

/// Forwards to a local store while counting how often the backend is
/// actually consulted; the cache tests read the counter.
pub(crate) struct CountingStore {
  inner: LocalStore,
  cache: PathInfoCache,
  pub queries: AtomicUsize,
}

impl CountingStore {
  pub fn new(inner: LocalStore, ttl_positive: Duration, ttl_negative: Duration) -> Self {
    Self {
      inner,
      cache: PathInfoCache::with_config(1024, ttl_positive, ttl_negative),
      queries: AtomicUsize::new(0),
    }
  }

  pub fn backend_queries(&self) -> usize {
    self.queries.load(Ordering::SeqCst)
  }
}

impl Store for CountingStore {
  fn store_dir(&self) -> &Path {
    self.inner.store_dir()
  }

  fn uri(&self) -> String {
    "counting".into()
  }

  fn info_cache(&self) -> &PathInfoCache {
    &self.cache
  }

  fn query_path_info_uncached<'s>(
    &'s self,
    path: &StorePath,
    callback: Callback<'s, Option<ValidPathInfo>>,
  ) {
    self.queries.fetch_add(1, Ordering::SeqCst);
    self.inner.query_path_info_uncached(path, callback)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::copy::{copy_closure, copy_paths};
  use crate::derivation::output_path_name;
  use crate::{copy_store_path, BuildMode, CheckSigs, HashModulo, Repair, Store, Substitute};
  use std::collections::BTreeMap;

  fn sha256(data: &[u8]) -> Hash {
    Hash::hash(data, HashType::SHA256)
  }

  fn literal_path(store: &dyn Store, hash_char: char, name: &str) -> StorePath {
    let base = format!("{}-{}", hash_char.to_string().repeat(32), name);
    store
      .parse_store_path(&store.store_dir().join(base))
      .unwrap()
  }

  // -- store path naming ------------------------------------------------

  #[test]
  fn store_paths_are_deterministic() {
    let (_dir, store) = test_store();
    let h = sha256(b"hello");

    let p1 = store.make_store_path("text", h, "foo").unwrap();
    let p2 = store.make_store_path("text", h, "foo").unwrap();
    assert_eq!(p1, p2);
    assert_eq!(p1.name(), "foo");
    assert_eq!(p1.hash_part().len(), 32);

    // a second handle to the same store dir agrees
    let mut params = StoreParams::new();
    params.insert(
      "store".into(),
      store.store_dir().display().to_string(),
    );
    let other = LocalStore::open(&params).unwrap();
    assert_eq!(other.make_store_path("text", h, "foo").unwrap(), p1);
  }

  #[test]
  fn store_dir_disambiguates_paths() {
    let (_da, a) = test_store();
    let (_db, b) = test_store();
    let h = sha256(b"hello");

    // same inputs, different store dir: different hash part
    let pa = a.make_store_path("text", h, "foo").unwrap();
    let pb = b.make_store_path("text", h, "foo").unwrap();
    assert_ne!(pa.hash_part(), pb.hash_part());
  }

  #[test]
  fn output_paths_suffix_nondefault_ids() {
    let (_dir, store) = test_store();
    let h = sha256(b"drv");

    let out = store.make_output_path("out", h, "pkg-1.0").unwrap();
    assert_eq!(out.name(), "pkg-1.0");

    let dev = store.make_output_path("dev", h, "pkg-1.0").unwrap();
    assert_eq!(dev.name(), "pkg-1.0-dev");

    assert_eq!(output_path_name("pkg-1.0", "out"), "pkg-1.0");
    assert_eq!(output_path_name("pkg-1.0", "dev"), "pkg-1.0-dev");
  }

  #[test]
  fn fixed_output_path_rules() {
    let (_dir, store) = test_store();

    // recursive sha256 uses the source scheme and admits references
    let h256 = sha256(b"content");
    let refs = [literal_path(&store, '0', "dep")]
      .into_iter()
      .collect::<StorePathSet>();
    store
      .make_fixed_output_path(FileIngestionMethod::Recursive, h256, "x", &refs, true)
      .unwrap();

    // everything else must be reference-free
    assert!(store
      .make_fixed_output_path(FileIngestionMethod::Flat, h256, "x", &refs, false)
      .is_err());

    // git ingestion demands sha1
    let err = store
      .make_fixed_output_path(
        FileIngestionMethod::Git,
        h256,
        "x",
        &Default::default(),
        false,
      )
      .unwrap_err();
    assert!(err.to_string().contains("must use sha1"));
    store
      .make_fixed_output_path(
        FileIngestionMethod::Git,
        Hash::hash("content", HashType::SHA1),
        "x",
        &Default::default(),
        false,
      )
      .unwrap();
  }

  #[test]
  fn ca_paths_recompute_to_themselves() {
    let (_dir, store) = test_store();
    let contents = b"some text";
    let path = store
      .add_text_to_store("note", contents, &Default::default(), Repair::Off)
      .unwrap();

    let info = store.get_path_info(&path).unwrap();
    let full = info.full_content_address().unwrap().unwrap();
    assert_eq!(store.make_fixed_output_path_from_ca(&full).unwrap(), path);
    assert!(info.is_content_addressed(&store).unwrap());
  }

  // -- derivations ------------------------------------------------------

  fn simple_derivation(store: &dyn Store, name: &str, out: Output) -> Derivation {
    let mut outputs = BTreeMap::new();
    outputs.insert("out".to_string(), out);
    Derivation {
      name: name.to_string(),
      builder: "/bin/sh".into(),
      platform: "x86_64-linux".into(),
      args: vec!["-c".into(), "echo hi".into()],
      outputs,
      ..Default::default()
    }
  }

  #[test]
  fn aterm_roundtrip_bytes() {
    let (_dir, store) = test_store();
    let out_path = literal_path(&store, '0', "foo");
    let printed_out = store.print_store_path(&out_path);

    let aterm = format!(
      "Derive([(\"out\",\"{p}\",\"\",\"\")],[],[],\"x86_64-linux\",\"/bin/sh\",[\"-c\",\"echo hi\"],[(\"out\",\"{p}\")])",
      p = printed_out
    );

    let drv = Derivation::parse(&store, "foo".to_string(), &aterm).unwrap();
    assert_eq!(drv.ty().unwrap(), DerivationType::InputAddressed);
    assert_eq!(
      drv.outputs["out"],
      Output::InputAddressed(out_path.clone())
    );
    assert_eq!(drv.env["out"], printed_out);

    let unparsed = drv.print(&store, false, None).to_string();
    assert_eq!(unparsed, aterm);

    // and the reparse agrees with the original structure
    let drv2 = Derivation::parse(&store, "foo".to_string(), &unparsed).unwrap();
    assert_eq!(drv2, drv);
  }

  #[test]
  fn aterm_escapes_roundtrip() {
    let (_dir, store) = test_store();
    let out_path = literal_path(&store, '0', "esc");

    let mut drv = simple_derivation(&store, "esc", Output::InputAddressed(out_path));
    drv.args = vec!["tab\there".into(), "line\nbreak".into(), "q\"q\\q".into()];
    drv
      .env
      .insert("tricky".into(), "a\rb\tc".into());

    let text = drv.print(&store, false, None).to_string();
    let reparsed = Derivation::parse(&store, "esc".to_string(), text).unwrap();
    assert_eq!(reparsed, drv);
  }

  #[test]
  fn parser_rejects_trailing_garbage() {
    let (_dir, store) = test_store();
    let p = store.print_store_path(&literal_path(&store, '0', "foo"));
    // a list "terminated" by neither `,` nor `]`
    let bad = format!(
      "Derive([(\"out\",\"{p}\",\"\",\"\")x],[],[],\"a\",\"/b\",[],[])",
      p = p
    );
    assert!(Derivation::parse(&store, "foo".into(), bad).is_err());
  }

  #[test]
  fn type_discipline_is_enforced() {
    let (_dir, store) = test_store();
    let p = store.print_store_path(&literal_path(&store, '0', "foo"));

    // fixed output not named "out"
    let bad = format!(
      "Derive([(\"lib\",\"{p}\",\"sha256\",\"{h}\")],[],[],\"a\",\"/b\",[],[])",
      p = p,
      h = sha256(b"").encode(Encoding::Base16)
    );
    assert!(Derivation::parse(&store, "foo".into(), bad).is_err());

    // mixing a fixed and a regular output
    let mixed = format!(
      "Derive([(\"doc\",\"{p}\",\"\",\"\"),(\"out\",\"{p}\",\"sha256\",\"{h}\")],[],[],\"a\",\"/b\",[],[])",
      p = p,
      h = sha256(b"").encode(Encoding::Base16)
    );
    assert!(Derivation::parse(&store, "foo".into(), mixed).is_err());
  }

  #[test]
  fn hash_placeholders_follow_the_output_name() {
    use crate::derivation::hash_placeholder;

    let out = hash_placeholder("out");
    assert_eq!(
      out,
      format!(
        "/{}",
        sha256(b"nix-output:out").encode(Encoding::Base32)
      )
    );
    // stable, absolute, and one placeholder per output name
    assert_eq!(hash_placeholder("out"), out);
    assert!(out.starts_with('/'));
    assert_ne!(hash_placeholder("dev"), out);
  }

  #[test]
  fn masked_unparse_blanks_outputs() {
    let (_dir, store) = test_store();
    let out_path = literal_path(&store, '0', "foo");
    let printed = store.print_store_path(&out_path);

    let mut drv = simple_derivation(&store, "foo", Output::InputAddressed(out_path));
    drv.env.insert("out".into(), printed.clone());
    drv.env.insert("keep".into(), "kept".into());

    let masked = drv.print(&store, true, None).to_string();
    assert!(!masked.contains(&printed));
    assert!(masked.contains("(\"out\",\"\")"));
    assert!(masked.contains("(\"keep\",\"kept\")"));
  }

  // -- hashing modulo ---------------------------------------------------

  #[test]
  fn fixed_output_modulo_formula() {
    let (_dir, store) = test_store();
    let empty = sha256(b"");
    let fixed = FixedOutputHash {
      method: FileIngestionMethod::Flat,
      hash: empty,
    };
    let drv = simple_derivation(&store, "foo", Output::Fixed(fixed));

    let modulo = store.hash_derivation_modulo(&drv, false).unwrap();
    let map = modulo.as_fixed_output().unwrap();

    let out_path = store
      .make_fixed_output_path(
        FileIngestionMethod::Flat,
        empty,
        "foo",
        &Default::default(),
        false,
      )
      .unwrap();
    let expected = Hash::hash(
      format!(
        "fixed:out:sha256:{}:{}",
        empty.encode(Encoding::Base16),
        store.print_store_path(&out_path)
      ),
      HashType::SHA256,
    );
    assert_eq!(map["out"], expected);
  }

  #[test]
  fn floating_outputs_are_refused() {
    let (_dir, store) = test_store();
    let drv = simple_derivation(
      &store,
      "foo",
      Output::Floating(FileIngestionMethod::Recursive, HashType::SHA256),
    );
    let err = store.hash_derivation_modulo(&drv, false).unwrap_err();
    assert!(err.to_string().contains("unimplemented"));
  }

  #[test]
  fn fixed_upstreams_collapse_anonymously() {
    let (_dir, store) = test_store();
    let fetch_hash = FixedOutputHash {
      method: FileIngestionMethod::Flat,
      hash: sha256(b"tarball"),
    };

    let write_dep = |marker: &str| -> StorePath {
      let mut dep = simple_derivation(&store, "dep", Output::Fixed(fetch_hash));
      dep.env.insert("marker".into(), marker.into());
      store.write_derivation(&dep, Repair::Off, false).unwrap()
    };

    // two fixed-output derivations with the same declared hash but
    // different texts, hence different drv paths
    let dep1 = write_dep("one");
    let dep2 = write_dep("two");
    assert_ne!(dep1, dep2);

    let downstream = |dep: &StorePath| -> Hash {
      let out_path = literal_path(&store, '1', "app");
      let mut drv = simple_derivation(&store, "app", Output::InputAddressed(out_path));
      drv
        .input_derivations
        .insert(dep.clone(), std::iter::once("out".to_string()).collect());
      match store.hash_derivation_modulo(&drv, true).unwrap() {
        HashModulo::Normal(h) => h,
        other => panic!("expected a single hash, got {:?}", other),
      }
    };

    // the downstream hash does not depend on which derivation fetched
    // the bytes
    assert_eq!(downstream(&dep1), downstream(&dep2));
  }

  #[test]
  fn modulo_is_insensitive_to_insertion_order() {
    let (_dir, store) = test_store();
    let out_path = literal_path(&store, '1', "app");

    let build = |env_pairs: &[(&str, &str)]| {
      let mut drv = simple_derivation(&store, "app", Output::InputAddressed(out_path.clone()));
      for (k, v) in env_pairs {
        drv.env.insert(k.to_string(), v.to_string());
      }
      drv
        .input_sources
        .insert(literal_path(&store, '2', "src"));
      drv.input_sources.insert(literal_path(&store, '3', "aux"));
      match store.hash_derivation_modulo(&drv, true).unwrap() {
        HashModulo::Normal(h) => h,
        other => panic!("expected a single hash, got {:?}", other),
      }
    };

    assert_eq!(
      build(&[("a", "1"), ("b", "2")]),
      build(&[("b", "2"), ("a", "1")])
    );
  }

  // -- path info, fingerprints, signatures ------------------------------

  #[test]
  fn fingerprint_ignores_mutable_metadata() {
    let (_dir, store) = test_store();
    let path = literal_path(&store, '4', "thing");
    let dep = literal_path(&store, '5', "dep");

    let mut info = ValidPathInfo::new(path.clone(), sha256(b"nar"));
    info.nar_size = Some(120);
    info.insert_reference_possibly_to_self(dep.clone());
    info.insert_reference_possibly_to_self(path.clone());

    let baseline = info.fingerprint(&store).unwrap();

    info.ultimate = true;
    info.registration_time = Some(std::time::SystemTime::now());
    info.sigs.insert("somebody:c2ln".into());
    assert_eq!(info.fingerprint(&store).unwrap(), baseline);

    // the self reference shows up in the reference list, in rendered
    // order ('4...-thing' sorts before '5...-dep')
    assert!(baseline.ends_with(&format!(
      "{},{}",
      store.print_store_path(&path),
      store.print_store_path(&dep)
    )));
  }

  #[test]
  fn fingerprint_requires_hash_and_size() {
    let (_dir, store) = test_store();
    let mut info = ValidPathInfo::new(literal_path(&store, '4', "thing"), sha256(b"nar"));
    assert!(info.fingerprint(&store).is_err());
    info.nar_size = Some(1);
    assert!(info.fingerprint(&store).is_ok());
  }

  #[test]
  fn signatures_and_ca_sentinel() {
    use crate::path_info::MAX_SIGS;
    use crate::signing::{PublicKeys, SecretKey};

    let (_dir, store) = test_store();

    let key = SecretKey::parse(&format!(
      "unit-test-1:{}",
      base64::encode([9u8; 32])
    ))
    .unwrap();
    let mut keys = PublicKeys::new();
    let public = key.to_public();
    keys.insert(public.name().to_string(), public);

    // a non-CA path needs signatures
    let mut info = ValidPathInfo::new(literal_path(&store, '6', "opaque"), sha256(b"nar"));
    info.nar_size = Some(7);
    assert_eq!(info.check_signatures(&store, &keys).unwrap(), 0);
    info.sign(&store, &key).unwrap();
    assert_eq!(info.check_signatures(&store, &keys).unwrap(), 1);

    // a verifiably content-addressed path does not
    let text = store
      .add_text_to_store("t", b"payload", &Default::default(), Repair::Off)
      .unwrap();
    let ca_info = store.get_path_info(&text).unwrap();
    assert_eq!(
      ca_info.check_signatures(&store, &keys).unwrap(),
      MAX_SIGS
    );
  }

  // -- cache behaviour --------------------------------------------------

  #[test]
  fn negative_ttl_gates_backend_queries() {
    let (_dir, inner) = test_store();
    let store = CountingStore::new(
      inner,
      Duration::from_secs(3600),
      Duration::from_millis(250),
    );

    let missing = literal_path(&store, '7', "ghost");

    assert!(!store.is_valid_path(&missing).unwrap());
    assert_eq!(store.backend_queries(), 1);

    // within the negative TTL the cache answers
    assert!(!store.is_valid_path(&missing).unwrap());
    assert!(store.get_path_info(&missing).is_err());
    assert_eq!(store.backend_queries(), 1);

    std::thread::sleep(Duration::from_millis(400));
    assert!(!store.is_valid_path(&missing).unwrap());
    assert_eq!(store.backend_queries(), 2);
  }

  #[test]
  fn positive_hits_are_served_from_cache() {
    let (_dir, inner) = test_store();
    let path = inner
      .add_text_to_store("hit", b"cached", &Default::default(), Repair::Off)
      .unwrap();
    let store = CountingStore::new(
      inner,
      Duration::from_secs(3600),
      Duration::from_secs(3600),
    );

    let first = store.get_path_info(&path).unwrap();
    assert_eq!(store.backend_queries(), 1);
    let second = store.get_path_info(&path).unwrap();
    assert_eq!(store.backend_queries(), 1);
    assert_eq!(first, second);
  }

  #[test]
  fn invalid_paths_surface_as_error_kind() {
    let (_dir, store) = test_store();
    let missing = literal_path(&store, '7', "ghost");
    let err = store.get_path_info(&missing).unwrap_err();
    assert!(err.downcast_ref::<cask_util::InvalidPath>().is_some());
  }

  #[test]
  fn bulk_queries_return_the_valid_subset() {
    let (_dir, store) = test_store();
    let a = store
      .add_text_to_store("a", b"alpha", &Default::default(), Repair::Off)
      .unwrap();
    let b = store
      .add_text_to_store("b", b"beta", &Default::default(), Repair::Off)
      .unwrap();
    let ghost = literal_path(&store, '7', "ghost");

    let asked = [a.clone(), b.clone(), ghost]
      .into_iter()
      .collect::<StorePathSet>();
    let valid = store.query_valid_paths(&asked, Substitute::Off).unwrap();

    assert_eq!(valid, [a, b].into_iter().collect::<StorePathSet>());
  }

  // -- copying ----------------------------------------------------------

  #[test]
  fn copy_store_path_moves_bytes_and_clears_ultimate() {
    let (_src_dir, src) = test_store();
    let (_dst_dir, dst) = test_store();

    let dep = src
      .add_text_to_store("dep", b"dependency", &Default::default(), Repair::Off)
      .unwrap();
    assert!(src.get_path_info(&dep).unwrap().ultimate);

    copy_store_path(&src, &dst, &dep, Repair::Off, CheckSigs::Off).unwrap();

    // the text path was renamed to the destination's convention
    let dst_path = dst
      .make_fixed_output_path_from_ca(
        &src
          .get_path_info(&dep)
          .unwrap()
          .full_content_address()
          .unwrap()
          .unwrap(),
      )
      .unwrap();
    assert!(dst.is_valid_path(&dst_path).unwrap());
    let copied = dst.get_path_info(&dst_path).unwrap();
    assert!(!copied.ultimate);
    assert_eq!(
      std::fs::read(dst.to_real_path(&dst_path)).unwrap(),
      b"dependency"
    );
  }

  #[test]
  fn copy_closure_lands_references_first_and_renames_ca_paths() {
    let (_src_dir, src) = test_store();
    let (_dst_dir, dst) = test_store();

    let dep = src
      .add_text_to_store("dep", b"dep contents", &Default::default(), Repair::Off)
      .unwrap();
    let refs = [dep.clone()].into_iter().collect::<StorePathSet>();
    let app = src
      .add_text_to_store("app", b"app contents", &refs, Repair::Off)
      .unwrap();

    let roots = [app.clone()].into_iter().collect::<StorePathSet>();
    let paths_map = copy_closure(
      &src,
      &dst,
      &roots,
      Repair::Off,
      CheckSigs::Off,
      Substitute::Off,
    )
    .unwrap();

    // dep has no references, so it is renamed to dst's naming; app keeps
    // its name because its reference set is not empty
    assert_ne!(paths_map[&dep], dep);
    assert_eq!(paths_map[&app], app);

    for (from, to) in &paths_map {
      assert!(dst.is_valid_path(to).unwrap(), "missing copy of {}", from);
    }

    // copying again is a no-op: everything is already valid
    let again = copy_paths(
      &src,
      &dst,
      &roots,
      Repair::Off,
      CheckSigs::Off,
      Substitute::Off,
    )
    .unwrap();
    assert_eq!(again[&app], app);
  }

  #[test]
  fn unsupported_operations_are_distinguishable() {
    let (_dir, store) = test_store();
    let p = literal_path(&store, '0', "x.drv");
    let drv = simple_derivation(&store, "x", Output::InputAddressed(literal_path(&store, '1', "x")));
    let err = store
      .build_derivation(&p, &drv, BuildMode::Build)
      .unwrap_err();
    assert!(err.downcast_ref::<cask_util::Unsupported>().is_some());
  }
}
