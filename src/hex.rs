use core::fmt;

/// Number of leading bytes rendered by [`HexSlice::short`].
const SHORT_BYTES: usize = 4;

/// Lowercase hex rendering of a byte slice for logs and `Display` impls.
pub struct HexSlice<'a> {
    bytes: &'a [u8],
    truncate: bool,
}

impl<'a> HexSlice<'a> {
    fn new<T>(data: &'a T) -> HexSlice<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        HexSlice {
            bytes: data.as_ref(),
            truncate: false,
        }
    }

    /// Only render the first few bytes, followed by `..` if anything was cut.
    pub fn short(mut self) -> Self {
        self.truncate = true;
        self
    }
}

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cut = self.truncate && self.bytes.len() > SHORT_BYTES;
        let shown = if cut {
            &self.bytes[..SHORT_BYTES]
        } else {
            self.bytes
        };
        for byte in shown {
            write!(f, "{:02x}", byte)?;
        }
        if cut {
            f.write_str("..")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> HexSlice<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexSlice<'_> {
        HexSlice::new(self)
    }
}
