//! A queue of nodes with dependency edges: a node can be dequeued only
//! once all of its dependencies have been reported finished. Dequeue
//! prefers nodes with many transitive dependants so the wide parts of the
//! graph drain first.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

#[derive(Debug)]
pub struct DependencyQueue<N: Hash + Eq, V> {
  dep_map: HashMap<N, (HashSet<N>, V)>,
  reverse_dep_map: HashMap<N, HashSet<N>>,
  priority: HashMap<N, usize>,
}

impl<N: Hash + Eq, V> Default for DependencyQueue<N, V> {
  fn default() -> Self {
    Self {
      dep_map: HashMap::new(),
      reverse_dep_map: HashMap::new(),
      priority: HashMap::new(),
    }
  }
}

impl<N: Hash + Eq + Clone, V> DependencyQueue<N, V> {
  pub fn contains(&self, key: &N) -> bool {
    self.dep_map.contains_key(key)
  }

  pub fn enqueue(&mut self, key: N, value: V, dependencies: impl IntoIterator<Item = N>) {
    assert!(!self.dep_map.contains_key(&key));

    let mut my_dependencies = HashSet::new();
    for dep in dependencies {
      self
        .reverse_dep_map
        .entry(dep.clone())
        .or_insert_with(HashSet::new)
        .insert(key.clone());
      my_dependencies.insert(dep);
    }
    self.dep_map.insert(key, (my_dependencies, value));
  }

  /// Compute dequeue priorities; call once after the last `enqueue`.
  pub fn queue_finished(&mut self) {
    let mut out = HashMap::new();
    for key in self.dep_map.keys() {
      depth(key, &self.reverse_dep_map, &mut out);
    }
    self.priority = out.into_iter().map(|(n, set)| (n, set.len())).collect();

    fn depth<'a, N: Hash + Eq + Clone>(
      key: &N,
      map: &HashMap<N, HashSet<N>>,
      results: &'a mut HashMap<N, HashSet<N>>,
    ) -> &'a HashSet<N> {
      if results.contains_key(key) {
        let slot = &results[key];
        assert!(!slot.is_empty(), "cycle in the dependency graph");
        return slot;
      }
      results.insert(key.clone(), HashSet::new());

      let mut set = HashSet::new();
      set.insert(key.clone());

      for dependant in map.get(key).into_iter().flatten() {
        set.extend(depth(dependant, map, results).iter().cloned())
      }

      let slot = results.get_mut(key).unwrap();
      *slot = set;
      &*slot
    }
  }

  /// The next node whose dependencies have all finished, if any.
  pub fn dequeue(&mut self) -> Option<(N, V)> {
    let key = self
      .dep_map
      .iter()
      .filter(|(_, (deps, _))| deps.is_empty())
      .map(|(key, _)| key.clone())
      .max_by_key(|k| self.priority[k])?;
    let (_, value) = self.dep_map.remove(&key).unwrap();
    Some((key, value))
  }

  pub fn is_empty(&self) -> bool {
    self.dep_map.is_empty()
  }

  pub fn len(&self) -> usize {
    self.dep_map.len()
  }

  /// Report `node` finished, unblocking its dependants. Returns the nodes
  /// that became ready.
  pub fn finish(&mut self, node: &N) -> Vec<&N> {
    let dependants = match self.reverse_dep_map.get(node) {
      Some(d) => d,
      None => return Vec::new(),
    };
    let mut result = Vec::new();
    for dep in dependants {
      if let Some((edges, _)) = self.dep_map.get_mut(dep) {
        assert!(edges.remove(node));
        if edges.is_empty() {
          result.push(dep);
        }
      }
    }
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn respects_dependency_order() {
    let mut queue = DependencyQueue::<&str, ()>::default();
    queue.enqueue("app", (), ["lib"]);
    queue.enqueue("lib", (), []);
    queue.queue_finished();

    let (first, _) = queue.dequeue().unwrap();
    assert_eq!(first, "lib");
    // app is blocked until lib finishes
    assert!(queue.dequeue().is_none());
    queue.finish(&"lib");
    assert_eq!(queue.dequeue().unwrap().0, "app");
    assert!(queue.is_empty());
  }

  #[test]
  fn prioritises_wide_subtrees() {
    let mut queue = DependencyQueue::<&str, ()>::default();
    // narrow: a1 -> leaf1; wide: b1, b2, b3 -> leaf2
    queue.enqueue("a1", (), ["leaf1"]);
    queue.enqueue("leaf1", (), []);
    for b in ["b1", "b2", "b3"] {
      queue.enqueue(b, (), ["leaf2"]);
    }
    queue.enqueue("leaf2", (), []);
    queue.queue_finished();

    assert_eq!(queue.dequeue().unwrap().0, "leaf2");
  }
}
