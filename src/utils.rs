use core::fmt;

/// `Debug`-formats its contents as a hexadecimal byte slice.
#[derive(Copy, Clone)]
pub struct HexSlice<T>(pub T)
where
    T: AsRef<[u8]>;

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, byte) in self.0.as_ref().iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        f.write_str("]")
    }
}

impl<T: AsRef<[u8]>> AsRef<T> for HexSlice<T> {
    fn as_ref(&self) -> &T {
        &self.0
    }
}

/// Compares two `(iv, seq)` ordered pairs the way the replay protection list does: IV index is
/// the primary sort key, sequence number the secondary one.
pub fn iv_seq_greater(iv: u32, seq: u32, stored_iv: u32, stored_seq: u32) -> bool {
    (iv, seq) > (stored_iv, stored_seq)
}
