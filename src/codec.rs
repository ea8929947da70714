use std::io::{self, Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use sha2::{Digest, Sha256};

use crate::metric::Metric;

/// Header carrying the hex body signature.
pub const SIGNATURE_HEADER: &str = "HashSHA256";

/// JSON array of metrics, as posted to `/updates/`.
pub fn encode_batch(metrics: &[Metric]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(metrics)
}

pub fn gzip(buf: &[u8]) -> io::Result<Vec<u8>> {
    let mut wtr = GzEncoder::new(Vec::with_capacity(buf.len() / 2), Compression::default());
    wtr.write_all(buf)?;
    wtr.finish()
}

pub fn gunzip(buf: &[u8]) -> io::Result<Vec<u8>> {
    let mut rdr = GzDecoder::new(buf);
    let mut out = vec![];
    rdr.read_to_end(&mut out)?;
    Ok(out)
}

/// `hex(sha256(body ‖ key))`
pub fn sign(body: &[u8], key: &str) -> String {
    let digest = Sha256::new()
        .chain_update(body)
        .chain_update(key.as_bytes())
        .finalize();
    hex::encode(digest)
}

pub fn verify(body: &[u8], key: &str, signature: &str) -> bool {
    sign(body, key).eq_ignore_ascii_case(signature)
}
