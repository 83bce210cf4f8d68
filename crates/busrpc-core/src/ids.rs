//! Request, stream, client and server identifiers.
//!
//! Every identifier is 16 ASCII bytes: a 4-byte role prefix followed by
//! 12 characters from a 62-symbol alphanumeric alphabet. Characters are
//! drawn 6 bits at a time and values >= 62 are rejected so the output stays
//! uniform over the alphabet.

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// Total length of every generated identifier.
pub const ID_LEN: usize = 16;

/// Length of the role prefix.
pub const PREFIX_LEN: usize = 4;

/// Prefix of request ids.
pub const REQUEST_PREFIX: &str = "REQ_";
/// Prefix of stream ids.
pub const STREAM_PREFIX: &str = "STR_";
/// Prefix of client ids.
pub const CLIENT_PREFIX: &str = "CLI_";
/// Prefix of server ids.
pub const SERVER_PREFIX: &str = "SRV_";

/// Symbols an identifier body is drawn from.
pub const ALPHABET: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Chunks of 6 bits taken from one 64-bit draw.
const CHUNKS_PER_DRAW: usize = 10;

/// Source of identifiers, safe to share between tasks.
///
/// Servers and clients take one as a constructor argument so tests can
/// inject a seeded generator.
pub struct IdGenerator {
    rng: Mutex<SmallRng>,
}

impl IdGenerator {
    /// Create a generator seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Create a deterministic generator.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    /// New request id, also used to correlate stream frames with their acks.
    ///
    /// # Example
    ///
    /// ```rust
    /// use busrpc_core::ids::{IdGenerator, ID_LEN};
    ///
    /// let ids = IdGenerator::with_seed(1);
    /// let id = ids.request_id();
    /// assert!(id.starts_with("REQ_"));
    /// assert_eq!(id.len(), ID_LEN);
    /// ```
    pub fn request_id(&self) -> String {
        self.format_id(REQUEST_PREFIX)
    }

    /// New stream id.
    pub fn stream_id(&self) -> String {
        self.format_id(STREAM_PREFIX)
    }

    /// New client id; names the client's response, claim and stream channels.
    pub fn client_id(&self) -> String {
        self.format_id(CLIENT_PREFIX)
    }

    /// New server id, carried in every claim and response the server sends.
    pub fn server_id(&self) -> String {
        self.format_id(SERVER_PREFIX)
    }

    /// Format an identifier with an arbitrary 4-byte prefix.
    ///
    /// # Panics
    ///
    /// Panics if `prefix` is not exactly [`PREFIX_LEN`] bytes long.
    pub fn format_id(&self, prefix: &str) -> String {
        assert_eq!(prefix.len(), PREFIX_LEN, "id prefix must be 4 bytes");

        let mut buf = [0u8; ID_LEN];
        buf[..PREFIX_LEN].copy_from_slice(prefix.as_bytes());
        self.fill_chars(&mut buf[PREFIX_LEN..]);

        buf.iter().map(|&b| b as char).collect()
    }

    fn fill_chars(&self, out: &mut [u8]) {
        let mut rng = self.rng.lock();
        let mut n = 0;
        loop {
            let mut r = rng.next_u64();
            for _ in 0..CHUNKS_PER_DRAW {
                let idx = (r & 0x3f) as usize;
                if idx < ALPHABET.len() {
                    out[n] = ALPHABET[idx];
                    n += 1;
                    if n == out.len() {
                        return;
                    }
                }
                r >>= 6;
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").finish()
    }
}
