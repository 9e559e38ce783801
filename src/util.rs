//! Identifier and fingerprint helpers

use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

/// Bytes of random seed fed into identifier hashes
pub const RANDOM_SEED_LENGTH: usize = 32;

/// Length in hex chars of new identifiers
pub const ID_LENGTH: usize = 16;

/// Read size for streaming content hashes
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Fresh random seed bytes
pub fn random_seed() -> [u8; RANDOM_SEED_LENGTH] {
	let mut seed = [0u8; RANDOM_SEED_LENGTH];
	seed[..16].copy_from_slice(Uuid::new_v4().as_bytes());
	seed[16..].copy_from_slice(Uuid::new_v4().as_bytes());
	seed
}

/// Full-length random hex digest
pub fn random_hash() -> String {
	blake3::hash(&random_seed()).to_hex().to_string()
}

/// New random identifier, `ID_LENGTH` lowercase hex chars
pub fn new_identifier() -> String {
	let mut id = random_hash();
	id.truncate(ID_LENGTH);
	id
}

/// Hex digest of an in-memory buffer
pub fn hash(buf: &[u8]) -> String {
	blake3::hash(buf).to_hex().to_string()
}

/// Streaming hex digest of a file, read in `CHUNK_SIZE` pieces
pub async fn content_hash(path: &Path) -> io::Result<String> {
	let mut file = tokio::fs::File::open(path).await?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; CHUNK_SIZE];
	loop {
		let n = file.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}
	Ok(hasher.finalize().to_hex().to_string())
}


// vim: ts=4
