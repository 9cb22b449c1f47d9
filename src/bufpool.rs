use dashmap::DashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Cap on buffers retained per pool. Excess buffers are dropped on release
/// instead of growing the free list without bound.
const MAX_POOLED: usize = 64;

type FreeList = Arc<Mutex<Vec<Vec<u8>>>>;

/// Named pools of reusable byte buffers.
///
/// The name is a namespace: callers with different sizing policies must use
/// different pool names. Pools are created on demand; a borrowed buffer is
/// exclusively owned by its guard and returned (cleared) on drop.
pub struct BufferPools {
    pools: DashMap<String, FreeList>,
}

impl Default for BufferPools {
    fn default() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }
}

impl BufferPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, name: &str, capacity: usize) -> PooledBuffer {
        let home = if let Some(entry) = self.pools.get(name) {
            entry.value().clone()
        } else {
            self.pools
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                .clone()
        };

        let buf = home
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(capacity));

        PooledBuffer {
            buf: Some(buf),
            home,
        }
    }
}

/// RAII handle over a pooled buffer; derefs to `Vec<u8>`.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    home: FreeList,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer already released")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer already released")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            let mut free = self.home.lock().expect("buffer pool mutex poisoned");
            if free.len() < MAX_POOLED {
                free.push(buf);
            }
        }
    }
}
