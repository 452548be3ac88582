//! Doppelganger pool: structurally identical clones of a template wire
//!
//! Spawn and the parallel runners need many concurrent copies of one wire.
//! The pool duplicates the template (settings plus deep-cloned shards),
//! composes each fresh clone exactly once through the caller-provided
//! composer, and recycles released clones so steady-state acquisition
//! allocates nothing.

use crate::error::Result;
use crate::wire::Wire;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct WirePool {
    template: Wire,
    free: Mutex<Vec<Wire>>,
    spawned: AtomicUsize,
}

impl WirePool {
    pub fn new(template: Wire) -> Self {
        Self { template, free: Mutex::new(Vec::new()), spawned: AtomicUsize::new(0) }
    }

    pub fn template(&self) -> &Wire {
        &self.template
    }

    /// Number of clones ever created (excludes reuses).
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Take a clone: a released one if available, otherwise a fresh copy of
    /// the template run through `composer` once. Clones share the
    /// template's structure; only their variable snapshots differ.
    pub fn acquire(&self, composer: impl FnOnce(&Wire) -> Result<()>) -> Result<Wire> {
        if let Some(wire) = self.free.lock().expect("pool lock poisoned").pop() {
            return Ok(wire);
        }

        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let clone = self.duplicate(n)?;
        composer(&clone)?;
        Ok(clone)
    }

    /// Return a finished clone to the free list. The clone's shards are
    /// cleaned and its variable snapshot destroyed here, so a recycled
    /// clone always starts from a blank table.
    pub fn release(&self, wire: Wire) {
        debug_assert!(
            !wire.is_running(),
            "released clone {} is still running",
            wire.name()
        );
        wire.finalize_cleanup();
        wire.clear_on_stop();
        self.free.lock().expect("pool lock poisoned").push(wire);
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().expect("pool lock poisoned").len()
    }

    fn duplicate(&self, n: usize) -> Result<Wire> {
        let clone = Wire::new(format!("{}-{}", self.template.name(), n));
        clone.set_looped(self.template.is_looped());
        clone.set_unsafe(self.template.is_unsafe());

        let shards = self.template.shards_arc();
        for shard in shards.iter() {
            clone.add_shard(dyn_clone::clone_box(&**shard))?;
        }
        Ok(clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::compose_wire;
    use crate::shard::InstanceData;
    use crate::shards::core::{ConstShard, MathAdd};
    use crate::types::TypeInfo;
    use crate::value::Value;

    fn template() -> Wire {
        let w = Wire::new("tmpl");
        w.add_shard(Box::new(ConstShard::new(Value::Int(5)))).unwrap();
        w.add_shard(Box::new(MathAdd::new(Value::Int(1)))).unwrap();
        w
    }

    fn composer(wire: &Wire) -> Result<()> {
        compose_wire(wire, &InstanceData::with_input(TypeInfo::None)).map(|_| ())
    }

    #[test]
    fn test_acquire_composes_fresh_clone() {
        let pool = WirePool::new(template());
        let a = pool.acquire(composer).unwrap();
        assert_eq!(a.name(), "tmpl-0");
        assert_ne!(a.composed_hash(), 0);
        assert_eq!(a.shard_count(), 2);
        assert_eq!(a.run(Value::None).unwrap(), Value::Int(6));
    }

    #[test]
    fn test_release_reuses_clone() {
        let pool = WirePool::new(template());
        let a = pool.acquire(composer).unwrap();
        let id = a.id();
        a.stop();
        pool.release(a);
        assert_eq!(pool.free_count(), 1);

        let b = pool.acquire(|_| panic!("reused clones must not recompose")).unwrap();
        assert_eq!(b.id(), id);
        assert_eq!(pool.spawned(), 1);
    }

    #[test]
    fn test_clones_are_independent() {
        let pool = WirePool::new(template());
        let a = pool.acquire(composer).unwrap();
        let b = pool.acquire(composer).unwrap();
        assert!(!a.same_wire(&b));
        // both run to the same result from the same structure
        assert_eq!(a.run(Value::None).unwrap(), Value::Int(6));
        assert_eq!(b.run(Value::None).unwrap(), Value::Int(6));
        assert_eq!(pool.spawned(), 2);
    }

    #[test]
    fn test_template_is_never_lent_out() {
        let pool = WirePool::new(template());
        let a = pool.acquire(composer).unwrap();
        assert!(!a.same_wire(pool.template()));
    }
}
