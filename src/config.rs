//! Device identity and medium flags reported to the host.

/// Identity strings returned by INQUIRY plus the write-protect flag reported
/// by MODE SENSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub(crate) vendor: [u8; 8],
    pub(crate) product: [u8; 16],
    pub(crate) revision: [u8; 4],
    pub(crate) write_protect: bool,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            vendor: *b"COPPER  ",
            product: *b"Flash Partitions",
            revision: *b"1.00",
            write_protect: cfg!(feature = "write-protect"),
        }
    }

    /// T10 vendor identification, space padded or truncated to 8 bytes.
    pub const fn vendor(mut self, vendor: &str) -> Self {
        self.vendor = pad::<8>(vendor);
        self
    }

    /// Product identification, space padded or truncated to 16 bytes.
    pub const fn product(mut self, product: &str) -> Self {
        self.product = pad::<16>(product);
        self
    }

    /// Product revision level, space padded or truncated to 4 bytes.
    pub const fn revision(mut self, revision: &str) -> Self {
        self.revision = pad::<4>(revision);
        self
    }

    pub const fn write_protect(mut self, write_protect: bool) -> Self {
        self.write_protect = write_protect;
        self
    }

    pub const fn is_write_protected(&self) -> bool {
        self.write_protect
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

const fn pad<const N: usize>(s: &str) -> [u8; N] {
    let bytes = s.as_bytes();
    let mut out = [b' '; N];
    let mut i = 0;
    while i < N && i < bytes.len() {
        out[i] = bytes[i];
        i += 1;
    }
    out
}
