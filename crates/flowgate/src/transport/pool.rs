use bytes::BytesMut;
use flowgate_core::prelude::*;

/// Maximum UDP payload we accept from a client.
pub const UDP_BUFFER_SIZE: usize = 65_535;

/// A small free-list of datagram buffers. Every inbound packet borrows one;
/// the packet adapter returns it exactly once when dropped, so a flood of
/// dropped packets does not churn the allocator.
#[derive(Debug)]
pub struct BufferPool {
	free: Mutex<Vec<BytesMut>>,
	buf_size: usize,
	max_free: usize,
}

impl BufferPool {
	pub fn new(buf_size: usize, max_free: usize) -> Arc<BufferPool> {
		Arc::new(BufferPool {
			free: Mutex::new(Vec::new()),
			buf_size,
			max_free,
		})
	}

	pub fn udp() -> Arc<BufferPool> {
		BufferPool::new(UDP_BUFFER_SIZE, 256)
	}

	pub fn get(&self) -> BytesMut {
		let mut free = self.free.lock().expect("pool lock");
		free
			.pop()
			.unwrap_or_else(|| BytesMut::with_capacity(self.buf_size))
	}

	pub fn put(&self, mut buf: BytesMut) {
		buf.clear();
		let mut free = self.free.lock().expect("pool lock");
		if free.len() < self.max_free {
			free.push(buf);
		}
	}

	/// Number of buffers currently in the free list.
	pub fn free_len(&self) -> usize {
		self.free.lock().expect("pool lock").len()
	}

	/// Borrows a buffer that returns itself to the pool when dropped.
	pub fn get_pooled(self: &Arc<Self>) -> PooledBuffer {
		PooledBuffer {
			data: Some(self.get()),
			pool: self.clone(),
		}
	}
}

/// A pool buffer with drop-to-return semantics: exactly one return per
/// borrow, however the owning packet is disposed of.
pub struct PooledBuffer {
	data: Option<BytesMut>,
	pool: Arc<BufferPool>,
}

impl PooledBuffer {
	pub fn buf_mut(&mut self) -> &mut BytesMut {
		self.data.as_mut().expect("buffer present until drop")
	}
}

impl std::ops::Deref for PooledBuffer {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		self.data.as_deref().expect("buffer present until drop")
	}
}

impl Drop for PooledBuffer {
	fn drop(&mut self) {
		if let Some(buf) = self.data.take() {
			self.pool.put(buf);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn buffers_round_trip() {
		let pool = BufferPool::new(128, 4);
		let a = pool.get();
		let b = pool.get();
		assert_eq!(pool.free_len(), 0);
		pool.put(a);
		pool.put(b);
		assert_eq!(pool.free_len(), 2);
		// Reuse does not grow the free list.
		let c = pool.get();
		assert_eq!(pool.free_len(), 1);
		pool.put(c);
		assert_eq!(pool.free_len(), 2);
	}

	#[test]
	fn free_list_is_bounded() {
		let pool = BufferPool::new(16, 1);
		pool.put(BytesMut::with_capacity(16));
		pool.put(BytesMut::with_capacity(16));
		assert_eq!(pool.free_len(), 1);
	}
}
