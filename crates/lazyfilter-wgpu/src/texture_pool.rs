//! Reusable texture allocations keyed by size and format
//!
//! The pool exclusively owns idle textures. A [`PooledTexture`] handed out by
//! [`TexturePool::acquire`] belongs to the caller until it is passed back to
//! [`TexturePool::release`]; dropping it instead simply frees the allocation.

use crate::backend::{Backend, TextureKey};
use crate::error::RenderError;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A texture checked out of a [`TexturePool`]
#[derive(Debug)]
pub struct PooledTexture<T> {
    id: u64,
    key: TextureKey,
    generation: u64,
    texture: T,
}

impl<T> PooledTexture<T> {
    /// Pool-unique identity of the underlying allocation
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> TextureKey {
        self.key
    }

    /// Device generation the texture was allocated on
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn texture(&self) -> &T {
        &self.texture
    }
}

#[derive(Debug)]
struct PoolState<T> {
    idle: HashMap<TextureKey, VecDeque<PooledTexture<T>>>,
}

/// Pool of textures bucketed by [`TextureKey`]
///
/// Released textures are handed out again most-recent first. When a bucket holds
/// more than `max_idle_per_key` textures the least recently released one is dropped.
#[derive(Debug)]
pub struct TexturePool<B: Backend> {
    state: Mutex<PoolState<B::Texture>>,
    max_idle_per_key: Option<usize>,
    next_id: AtomicU64,
    allocations: AtomicU64,
}

impl<B: Backend> Default for TexturePool<B> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<B: Backend> TexturePool<B> {
    pub fn new(max_idle_per_key: Option<usize>) -> Self {
        Self {
            state: Mutex::new(PoolState { idle: HashMap::new() }),
            max_idle_per_key,
            next_id: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState<B::Texture>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns an idle texture with this key, allocating a new one if none is available
    ///
    /// Never waits on GPU work. Idle textures from an older device generation are
    /// discarded on the way.
    pub fn acquire(&self, backend: &B, key: TextureKey) -> Result<PooledTexture<B::Texture>, RenderError> {
        let generation = backend.generation();
        {
            let mut state = self.state();
            if let Some(bucket) = state.idle.get_mut(&key) {
                while let Some(texture) = bucket.pop_back() {
                    if texture.generation == generation {
                        tracing::trace!(id = texture.id, %key, "texture pool hit");
                        return Ok(texture);
                    }
                }
            }
        }

        let texture = backend.create_texture(&key)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, %key, "allocated pooled texture");
        Ok(PooledTexture { id, key, generation, texture })
    }

    /// Returns a texture to the idle set for its key
    pub fn release(&self, backend: &B, texture: PooledTexture<B::Texture>) {
        if texture.generation != backend.generation() {
            tracing::trace!(id = texture.id, "dropping texture from a previous device");
            return;
        }
        let mut state = self.state();
        let bucket = state.idle.entry(texture.key).or_default();
        bucket.push_back(texture);
        if let Some(limit) = self.max_idle_per_key {
            while bucket.len() > limit {
                if let Some(evicted) = bucket.pop_front() {
                    tracing::debug!(id = evicted.id, key = %evicted.key, "evicted idle texture");
                }
            }
        }
    }

    /// Drops every idle texture; textures currently checked out are unaffected
    pub fn clear(&self) {
        let mut state = self.state();
        let dropped = state.idle.values().map(VecDeque::len).sum::<usize>();
        state.idle.clear();
        tracing::debug!(dropped, "cleared texture pool");
    }

    pub fn idle_count(&self) -> usize {
        self.state().idle.values().map(VecDeque::len).sum()
    }

    pub fn idle_count_for(&self, key: TextureKey) -> usize {
        self.state().idle.get(&key).map_or(0, VecDeque::len)
    }

    /// Total number of textures this pool has allocated
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::testing::FakeBackend;

    fn key(width: u32, height: u32) -> TextureKey {
        TextureKey::new(width, height, PixelFormat::WORKING)
    }

    #[test]
    fn test_release_then_acquire_reuses_texture() {
        let backend = FakeBackend::new();
        let pool = TexturePool::new(None);

        let first = pool.acquire(&backend, key(4, 4)).unwrap();
        let first_id = first.id();
        let first_serial = first.texture().serial;
        pool.release(&backend, first);
        assert_eq!(pool.idle_count(), 1);

        let second = pool.acquire(&backend, key(4, 4)).unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(second.texture().serial, first_serial);
        assert_eq!(backend.texture_allocations(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_outstanding_textures_are_never_shared() {
        let backend = FakeBackend::new();
        let pool = TexturePool::new(None);

        let a = pool.acquire(&backend, key(4, 4)).unwrap();
        let b = pool.acquire(&backend, key(4, 4)).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.allocation_count(), 2);
    }

    #[test]
    fn test_keys_are_separate_buckets() {
        let backend = FakeBackend::new();
        let pool = TexturePool::new(None);

        let small = pool.acquire(&backend, key(4, 4)).unwrap();
        pool.release(&backend, small);

        let large = pool.acquire(&backend, key(8, 8)).unwrap();
        assert_eq!(large.key(), key(8, 8));
        assert_eq!(large.texture().key, key(8, 8));
        assert_eq!(backend.texture_allocations(), 2);
        assert_eq!(pool.idle_count_for(key(4, 4)), 1);
        assert_eq!(pool.idle_count_for(key(8, 8)), 0);
    }

    #[test]
    fn test_clear_drops_idle_only() {
        let backend = FakeBackend::new();
        let pool = TexturePool::new(None);

        let kept = pool.acquire(&backend, key(4, 4)).unwrap();
        let idle = pool.acquire(&backend, key(4, 4)).unwrap();
        pool.release(&backend, idle);
        pool.clear();
        assert_eq!(pool.idle_count(), 0);

        pool.release(&backend, kept);
        assert_eq!(pool.idle_count(), 1);

        let after_clear = pool.acquire(&backend, key(4, 4)).unwrap();
        assert_eq!(backend.texture_allocations(), 2);
        assert_eq!(after_clear.texture().serial, 0);
    }

    #[test]
    fn test_retention_bound_evicts_least_recently_released() {
        let backend = FakeBackend::new();
        let pool = TexturePool::new(Some(2));

        let textures = (0..3).map(|_| pool.acquire(&backend, key(2, 2)).unwrap()).collect::<Vec<_>>();
        let ids = textures.iter().map(PooledTexture::id).collect::<Vec<_>>();
        for texture in textures {
            pool.release(&backend, texture);
        }
        assert_eq!(pool.idle_count_for(key(2, 2)), 2);

        let a = pool.acquire(&backend, key(2, 2)).unwrap();
        let b = pool.acquire(&backend, key(2, 2)).unwrap();
        assert_eq!(a.id(), ids[2]);
        assert_eq!(b.id(), ids[1]);
    }

    #[test]
    fn test_stale_generation_is_not_reused() {
        let backend = FakeBackend::new();
        let pool = TexturePool::new(None);

        let texture = pool.acquire(&backend, key(4, 4)).unwrap();
        pool.release(&backend, texture);
        backend.bump_generation();

        let fresh = pool.acquire(&backend, key(4, 4)).unwrap();
        assert_eq!(fresh.generation(), backend.generation());
        assert_eq!(backend.texture_allocations(), 2);

        let old = PooledTexture { id: 99, key: key(4, 4), generation: 0, texture: fresh.texture().clone() };
        pool.release(&backend, old);
        assert_eq!(pool.idle_count(), 0);
    }
}
