use parking_lot::Mutex;

/// Bounded pool of byte buffers for secondary-key decoding.
///
/// `get` hands out a cleared buffer of at least `buf_len` capacity, reusing
/// a pooled one when available. `put` returns a buffer; beyond `max_pooled`
/// buffers are dropped instead of retained.
pub struct BytesBufPool {
    pool: Mutex<Vec<Vec<u8>>>,
    buf_len: usize,
    max_pooled: usize,
}

impl BytesBufPool {
    pub fn new(
        buf_len: usize,
        max_pooled: usize,
    ) -> Self {
        BytesBufPool {
            pool: Mutex::new(Vec::with_capacity(max_pooled)),
            buf_len,
            max_pooled,
        }
    }

    pub fn get(&self) -> Vec<u8> {
        match self.pool.lock().pop() {
            Some(buf) => buf,
            None => Vec::with_capacity(self.buf_len),
        }
    }

    pub fn put(
        &self,
        mut buf: Vec<u8>,
    ) {
        buf.clear();
        let mut pool = self.pool.lock();
        if pool.len() < self.max_pooled {
            pool.push(buf);
        }
    }

    /// Number of buffers currently pooled.
    pub fn pooled(&self) -> usize {
        self.pool.lock().len()
    }
}
