use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;

/// Correlation-tag generator for batch stream controls.
///
/// The upper 16 bits of every opaque come from a monotonic counter seeded
/// with a per-process random salt, so tags stay unique among in-flight
/// operations on a topic and do not collide across a quick restart. The low
/// 16 bits are zero; the producer stamps them with the vbucket id in its
/// echo.
pub(crate) struct OpaqueGenerator {
    counter: AtomicU16,
}

impl OpaqueGenerator {
    pub(crate) fn new() -> Self {
        OpaqueGenerator {
            counter: AtomicU16::new(rand::random::<u16>()),
        }
    }

    pub(crate) fn next_opaque(&self) -> u32 {
        let tag = self.counter.fetch_add(1, Ordering::Relaxed);
        (tag as u32) << 16
    }
}

/// The correlation half of an echoed opaque.
pub(crate) fn opaque_tag(opaque: u32) -> u16 {
    (opaque >> 16) as u16
}
