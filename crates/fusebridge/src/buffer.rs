//! Zero-copy access to kernel-owned memory.
//!
//! READ, WRITE, SETXATTR and GETXATTR hand the handler the kernel's own buffer
//! instead of a copy. The driver thread lends the buffer for exactly one
//! request and revokes the lease before its kernel call returns; any access
//! after that fails with [`BufferError::Expired`].

use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("kernel buffer accessed after its request completed")]
    Expired,

    #[error("kernel buffer is read-only")]
    ReadOnly,
}

struct RawRegion {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
}

// SAFETY: the region is only dereferenced while the lease mutex is held, and
// the lending thread is blocked (or waiting on that same mutex to revoke) for
// as long as the region is present.
unsafe impl Send for RawRegion {}

struct BufferLease {
    region: Mutex<Option<RawRegion>>,
    len: usize,
}

impl BufferLease {
    fn revoke(&self) {
        let mut region = self.region.lock().unwrap_or_else(PoisonError::into_inner);
        *region = None;
    }
}

/// Handle to a kernel buffer that is valid only while its request is in flight.
///
/// Access closures run with the lease locked; calling back into the same
/// buffer from inside one of them deadlocks.
#[derive(Clone)]
pub struct KernelBuf {
    lease: Arc<BufferLease>,
}

impl KernelBuf {
    pub fn len(&self) -> usize {
        self.lease.len
    }

    pub fn is_empty(&self) -> bool {
        self.lease.len == 0
    }

    /// Whether the lending request is still in flight.
    pub fn is_live(&self) -> bool {
        self.lease
            .region
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, BufferError> {
        let region = self
            .lease
            .region
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let raw = region.as_ref().ok_or(BufferError::Expired)?;
        // SAFETY: the region is present, so the lender still owns the memory
        // and is not touching it.
        let slice = unsafe { std::slice::from_raw_parts(raw.ptr.as_ptr(), raw.len) };
        Ok(f(slice))
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, BufferError> {
        let region = self
            .lease
            .region
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let raw = region.as_ref().ok_or(BufferError::Expired)?;
        if !raw.writable {
            return Err(BufferError::ReadOnly);
        }
        // SAFETY: as in `with`; the lock makes this the only live slice.
        let slice = unsafe { std::slice::from_raw_parts_mut(raw.ptr.as_ptr(), raw.len) };
        Ok(f(slice))
    }

    /// Copies as much of `src` as fits, returning the number of bytes written.
    pub fn copy_from(&self, src: &[u8]) -> Result<usize, BufferError> {
        self.with_mut(|dst| {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            n
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, BufferError> {
        self.with(|b| b.to_vec())
    }
}

impl fmt::Debug for KernelBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelBuf")
            .field("len", &self.len())
            .field("live", &self.is_live())
            .finish()
    }
}

struct Revoke(Arc<BufferLease>);

impl Drop for Revoke {
    fn drop(&mut self) {
        self.0.revoke();
    }
}

fn lease(ptr: NonNull<u8>, len: usize, writable: bool) -> Arc<BufferLease> {
    Arc::new(BufferLease {
        region: Mutex::new(Some(RawRegion { ptr, len, writable })),
        len,
    })
}

/// Lends `buf` writable for the duration of `f`.
pub(crate) fn lend_mut<R>(buf: &mut [u8], f: impl FnOnce(KernelBuf) -> R) -> R {
    let len = buf.len();
    let lease = lease(NonNull::from(buf).cast::<u8>(), len, true);
    let _revoke = Revoke(Arc::clone(&lease));
    f(KernelBuf { lease })
}

/// Lends `buf` read-only for the duration of `f`.
pub(crate) fn lend<R>(buf: &[u8], f: impl FnOnce(KernelBuf) -> R) -> R {
    let len = buf.len();
    let lease = lease(NonNull::from(buf).cast::<u8>(), len, false);
    let _revoke = Revoke(Arc::clone(&lease));
    f(KernelBuf { lease })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_through_lease() {
        let data = b"hello".to_vec();
        let out = lend(&data, |buf| buf.to_vec().unwrap());
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_write_through_lease() {
        let mut data = vec![0u8; 8];
        let n = lend_mut(&mut data, |buf| buf.copy_from(b"abc").unwrap());
        assert_eq!(n, 3);
        assert_eq!(&data[..3], b"abc");
        assert_eq!(data[3], 0);
    }

    #[test]
    fn test_copy_from_truncates() {
        let mut data = vec![0u8; 2];
        let n = lend_mut(&mut data, |buf| buf.copy_from(b"abcdef").unwrap());
        assert_eq!(n, 2);
        assert_eq!(data, b"ab");
    }

    #[test]
    fn test_read_only_rejects_write() {
        let data = vec![1u8; 4];
        let err = lend(&data, |buf| buf.copy_from(b"x").unwrap_err());
        assert_eq!(err, BufferError::ReadOnly);
    }

    #[test]
    fn test_expired_after_lend_returns() {
        let mut data = vec![0u8; 4];
        let kept = lend_mut(&mut data, |buf| {
            assert!(buf.is_live());
            buf.clone()
        });
        assert!(!kept.is_live());
        assert_eq!(kept.to_vec().unwrap_err(), BufferError::Expired);
        assert_eq!(kept.copy_from(b"x").unwrap_err(), BufferError::Expired);
        assert_eq!(kept.len(), 4);
        assert_eq!(data, vec![0u8; 4]);
    }

    #[test]
    fn test_expired_even_if_closure_panics() {
        let mut data = vec![0u8; 4];
        let slot: Mutex<Option<KernelBuf>> = Mutex::new(None);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lend_mut(&mut data, |buf| {
                *slot.lock().unwrap() = Some(buf);
                panic!("handler failed");
            })
        }));
        assert!(result.is_err());
        let kept = slot.lock().unwrap().take().unwrap();
        assert!(!kept.is_live());
    }

    #[test]
    fn test_access_from_other_thread() {
        let mut data = vec![0u8; 3];
        lend_mut(&mut data, |buf| {
            let remote = buf.clone();
            std::thread::spawn(move || remote.copy_from(b"xyz").unwrap())
                .join()
                .unwrap();
        });
        assert_eq!(data, b"xyz");
    }
}
