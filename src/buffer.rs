/* Growable byte container used for assembled memory dumps and per-dive
 * payloads. */
use std::ops::Deref;

#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /* Grow or shrink to `size` bytes; new bytes are zeroed. */
    pub fn resize(&mut self, size: usize) {
        self.data.resize(size, 0);
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /* Insert `bytes` in front of the current contents. Used for the     */
    /* `[id_len, logbook_len, id, logbook, dive]` blob convention where  */
    /* the profile arrives before its logbook context.                   */
    pub fn prepend(&mut self, bytes: &[u8]) {
        self.data.splice(0..0, bytes.iter().copied());
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_prepend() {
        let mut buf = Buffer::new();
        buf.append(&[3, 4, 5]);
        buf.prepend(&[1, 2]);
        assert_eq!(buf.data(), &[1, 2, 3, 4, 5]);
        assert_eq!(buf.size(), 5);
    }

    #[test]
    fn resize_zero_fills() {
        let mut buf = Buffer::new();
        buf.append(&[0xFF; 2]);
        buf.resize(4);
        assert_eq!(buf.data(), &[0xFF, 0xFF, 0, 0]);
        buf.resize(1);
        assert_eq!(buf.data(), &[0xFF]);
    }

    #[test]
    fn clear_keeps_nothing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"payload");
        buf.clear();
        assert!(buf.is_empty());
    }
}
