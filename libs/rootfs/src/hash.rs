//! Content hashing.
//!
//! Every digest in this crate is a lowercase hex sha256. The same function
//! names cache entries (digest of an image reference), published artifacts
//! (digest of the image file) and in-flight build keys (digest of digests).

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Buffer size used when streaming a file through the hasher.
const READ_BUF_BYTES: usize = 64 * 1024;

/// Digest a byte slice.
pub fn digest_bytes(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Digest a string.
pub fn digest_str(s: &str) -> String {
    digest_bytes(s.as_bytes())
}

/// Digest everything readable from `reader`.
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest the full contents of a file.
pub fn digest_file(path: &Path) -> io::Result<String> {
    digest_reader(File::open(path)?)
}

/// Digest a list of fields.
///
/// Each field is digested on its own and the concatenated hex digests are
/// digested again, so `["ab", "c"]` and `["a", "bc"]` yield different keys.
pub fn digest_of_fields<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined: String = fields
        .into_iter()
        .map(|field| digest_str(field.as_ref()))
        .collect();
    digest_str(&joined)
}
