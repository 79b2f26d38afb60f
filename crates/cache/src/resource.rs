//! Explicitly released binary resources
//!
//! Decoded page bitmaps and the display references created for them (object
//! URLs, texture handles) are not reclaimed by simply dropping a pointer: the
//! backing buffer has to be released. [`OwnedResource`] wraps a
//! [`ResourceHandle`] and makes sure `release()` reaches the handle exactly
//! once, whether the owner releases it explicitly or drops it.

use std::fmt;

/// A decoded, memory-backed resource produced by a decode service.
pub trait ResourceHandle: Send + 'static {
    /// Displayable reference handed to the UI (e.g. an object URL)
    fn display_ref(&self) -> &str;

    /// Size of the decoded buffer in bytes
    fn byte_len(&self) -> usize;

    /// Free the buffer and revoke the display reference.
    ///
    /// Called at most once by [`OwnedResource`].
    fn release(&mut self);
}

/// Exclusive owner of one resource handle.
///
/// Release is idempotent: the first call forwards to the handle, later calls
/// (including the one issued on drop) are no-ops.
pub struct OwnedResource {
    handle: Box<dyn ResourceHandle>,
    released: bool,
}

impl OwnedResource {
    /// Take ownership of a handle
    pub fn new(handle: Box<dyn ResourceHandle>) -> Self {
        Self {
            handle,
            released: false,
        }
    }

    /// Displayable reference of the underlying handle
    pub fn display_ref(&self) -> &str {
        self.handle.display_ref()
    }

    /// Size of the decoded buffer in bytes
    pub fn byte_len(&self) -> usize {
        self.handle.byte_len()
    }

    /// Whether the handle has already been released
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release the handle.
    ///
    /// Returns `true` if this call performed the release.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.handle.release();
        true
    }
}

impl From<Box<dyn ResourceHandle>> for OwnedResource {
    fn from(handle: Box<dyn ResourceHandle>) -> Self {
        Self::new(handle)
    }
}

impl Drop for OwnedResource {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for OwnedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedResource")
            .field("display_ref", &self.handle.display_ref())
            .field("byte_len", &self.handle.byte_len())
            .field("released", &self.released)
            .finish()
    }
}

/// In-process decoded buffer
///
/// Used by in-process decoders: the display reference is a synthetic
/// `mem://` URL and releasing frees the pixel buffer.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    display_ref: String,
    pixels: Vec<u8>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl DecodedBuffer {
    /// Create a decoded buffer for a content key
    pub fn new(key: &str, pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            display_ref: format!("mem://{key}"),
            pixels,
            width,
            height,
        }
    }

    /// Raw pixel data
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl ResourceHandle for DecodedBuffer {
    fn display_ref(&self) -> &str {
        &self.display_ref
    }

    fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    fn release(&mut self) {
        self.pixels = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct TrackedHandle {
        releases: Arc<AtomicUsize>,
    }

    impl ResourceHandle for TrackedHandle {
        fn display_ref(&self) -> &str {
            "blob://1"
        }

        fn byte_len(&self) -> usize {
            16
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked() -> (OwnedResource, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        let resource = OwnedResource::new(Box::new(TrackedHandle {
            releases: releases.clone(),
        }));
        (resource, releases)
    }

    #[test]
    fn test_release_is_idempotent() {
        let (mut resource, releases) = tracked();

        assert!(resource.release());
        assert!(!resource.release());
        assert!(resource.is_released());
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        drop(resource);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_once() {
        let (resource, releases) = tracked();
        assert_eq!(resource.display_ref(), "blob://1");
        assert_eq!(resource.byte_len(), 16);

        drop(resource);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decoded_buffer_release_frees_pixels() {
        let mut buffer = DecodedBuffer::new("book/001.jpg", vec![7u8; 64], 4, 4);
        assert_eq!(buffer.display_ref(), "mem://book/001.jpg");
        assert_eq!(buffer.byte_len(), 64);

        buffer.release();
        assert_eq!(buffer.byte_len(), 0);
        assert!(buffer.pixels().is_empty());
    }
}
