/// CRC32C (Castagnoli) value paired with the number of bytes it covers.
///
/// Carrying the length is what makes the value concatenable: the checksum of `a ++ b` is
/// derived from the checksums of `a` and `b` alone, so a running whole-object checksum never
/// has to revisit bytes that were already hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checksum {
    value: u32,
    len: u64,
}

impl Checksum {
    /// Checksum of zero bytes
    pub const EMPTY: Checksum = Checksum { value: 0, len: 0 };

    /// Rebuild a checksum reported elsewhere (e.g. by the server)
    pub fn new(value: u32, len: u64) -> Self {
        Self { value, len }
    }

    /// Hash `data`
    pub fn of(data: &[u8]) -> Self {
        Self {
            value: crc32c::crc32c(data),
            len: data.len() as u64,
        }
    }

    /// Checksum of the covered bytes followed by `data`
    pub fn append(&self, data: &[u8]) -> Checksum {
        Checksum {
            value: crc32c::crc32c_append(self.value, data),
            len: self.len + data.len() as u64,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Checksum of the bytes covered by `self` immediately followed by those covered by `next`
    pub fn concat(&self, next: &Checksum) -> Checksum {
        if next.is_empty() {
            return *self;
        }
        Checksum {
            value: crc32c::crc32c_combine(self.value, next.value, next.len as usize),
            len: self.len + next.len,
        }
    }

    /// Compare `data` against an expected value, returning the computed one on mismatch
    pub fn validate(expected: u32, data: &[u8]) -> Result<(), u32> {
        let actual = Self::of(data).value;
        if actual == expected {
            Ok(())
        } else {
            Err(actual)
        }
    }
}
