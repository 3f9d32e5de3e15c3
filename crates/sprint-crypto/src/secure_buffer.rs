//! Locked, auto-zeroizing byte buffers for key material and nonces.

use crate::CryptoError;
use zeroize::Zeroize;

/// An owned byte region holding secret material.
///
/// Guarantees:
/// - pages are pinned against swap where the platform supports `mlock`
///   (best-effort elsewhere; observable via [`SecureBuffer::locked`])
/// - the bytes are overwritten before the region is returned to the
///   allocator, on every exit path
/// - no API hands out a borrow that outlives the buffer; callers copy out
///   or work inside a scoped closure
pub struct SecureBuffer {
    data: Box<[u8]>,
    locked: bool,
}

impl SecureBuffer {
    /// Allocate a zeroed buffer of `len` bytes and pin its pages.
    pub fn new(len: usize) -> Result<Self, CryptoError> {
        if len == 0 {
            return Err(CryptoError::EmptyBuffer);
        }
        let data = vec![0u8; len].into_boxed_slice();
        let locked = lock_pages(data.as_ptr(), len);
        Ok(Self { data, locked })
    }

    /// Allocate and copy `src` in. The caller remains responsible for
    /// wiping its own copy of `src`.
    pub fn from_slice(src: &[u8]) -> Result<Self, CryptoError> {
        let mut buf = Self::new(src.len())?;
        buf.data.copy_from_slice(src);
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the pages are actually pinned on this platform.
    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Copy the contents into a caller-owned buffer of exactly the same
    /// size.
    pub fn read_into(&self, dest: &mut [u8]) -> Result<(), CryptoError> {
        if dest.len() != self.data.len() {
            return Err(CryptoError::SizeMismatch { dest: dest.len(), len: self.data.len() });
        }
        dest.copy_from_slice(&self.data);
        Ok(())
    }

    /// Run `f` over the contents without letting the borrow escape.
    pub fn expose<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.data)
    }

    /// Overwrite the contents. Used by the entropy generator.
    pub(crate) fn write_with(&mut self, f: impl FnOnce(&mut [u8])) {
        f(&mut self.data);
    }

    /// Constant-size equality against another byte slice, in constant time.
    pub fn ct_eq(&self, other: &[u8]) -> bool {
        use subtle::ConstantTimeEq;
        if other.len() != self.data.len() {
            return false;
        }
        self.data.ct_eq(other).into()
    }

    fn wipe(&mut self) {
        self.data.zeroize();
        if self.locked {
            unlock_pages(self.data.as_ptr(), self.data.len());
            self.locked = false;
        }
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print contents.
        write!(f, "SecureBuffer({} bytes, locked={})", self.data.len(), self.locked)
    }
}

#[cfg(unix)]
fn lock_pages(ptr: *const u8, len: usize) -> bool {
    // mlock can fail under RLIMIT_MEMLOCK; the buffer still works, only
    // the swap-pinning capability flag changes.
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(not(unix))]
fn lock_pages(_ptr: *const u8, _len: usize) -> bool {
    false
}

#[cfg(unix)]
fn unlock_pages(ptr: *const u8, len: usize) {
    unsafe {
        libc::munlock(ptr as *const libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn unlock_pages(_ptr: *const u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(SecureBuffer::new(0), Err(CryptoError::EmptyBuffer)));
    }

    #[test]
    fn test_read_into_size_checked() {
        let buf = SecureBuffer::from_slice(&[7u8; 16]).unwrap();
        let mut small = [0u8; 8];
        assert!(buf.read_into(&mut small).is_err());

        let mut exact = [0u8; 16];
        buf.read_into(&mut exact).unwrap();
        assert_eq!(exact, [7u8; 16]);
    }

    #[test]
    fn test_scoped_expose() {
        let buf = SecureBuffer::from_slice(b"super-secret-key").unwrap();
        let first = buf.expose(|bytes| bytes[0]);
        assert_eq!(first, b's');
    }

    #[test]
    fn test_constant_time_eq() {
        let buf = SecureBuffer::from_slice(&[1, 2, 3, 4]).unwrap();
        assert!(buf.ct_eq(&[1, 2, 3, 4]));
        assert!(!buf.ct_eq(&[1, 2, 3, 5]));
        assert!(!buf.ct_eq(&[1, 2, 3]));
    }

    #[test]
    fn test_bytes_zeroed_at_release() {
        // Run the release path by hand on a buffer we keep ownership of,
        // so the zeroed memory can still be observed legally.
        let mut buf = std::mem::ManuallyDrop::new(SecureBuffer::from_slice(&[0xFF; 64]).unwrap());
        buf.wipe();
        assert!(buf.expose(|bytes| bytes.iter().all(|&b| b == 0)));
        unsafe {
            std::mem::ManuallyDrop::drop(&mut buf);
        }
    }

    #[test]
    fn test_debug_never_leaks() {
        let buf = SecureBuffer::from_slice(b"hunter2-hunter2!").unwrap();
        let printed = format!("{buf:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("16 bytes"));
    }
}
