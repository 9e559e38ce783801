//! Challenge authentication of trusted peers
//!
//! Trusted peers share a secret (`local/auth.json`). The challenger sends a
//! random nonce, the answer is the BLAKE3 keyed hash of that nonce under the
//! shared secret. Comparison of the answer runs in constant time.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SyncError;
use crate::layout::Layout;
use crate::util::{self, RANDOM_SEED_LENGTH};

const SECRET_LENGTH: usize = blake3::KEY_LEN;

#[derive(Serialize, Deserialize)]
struct AuthFile {
	secret: String,
}

#[derive(Clone)]
pub struct Authenticator {
	secret: [u8; SECRET_LENGTH],
}

impl std::fmt::Debug for Authenticator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Authenticator").finish_non_exhaustive()
	}
}

impl Authenticator {
	pub fn new(secret: [u8; SECRET_LENGTH]) -> Self {
		Authenticator { secret }
	}

	/// Fresh random secret
	pub fn generate() -> Self {
		Authenticator::new(util::random_seed())
	}

	pub async fn load(layout: &Layout) -> Result<Self, SyncError> {
		let data = tokio::fs::read_to_string(layout.auth_file()).await?;
		let file: AuthFile = json5::from_str(&data)?;
		let bytes = STANDARD
			.decode(file.secret)
			.map_err(|e| SyncError::Serialization { message: format!("auth secret: {}", e) })?;
		let secret: [u8; SECRET_LENGTH] = bytes.try_into().map_err(|_| SyncError::Serialization {
			message: format!("auth secret must be {} bytes", SECRET_LENGTH),
		})?;
		Ok(Authenticator::new(secret))
	}

	/// Load the shared secret, creating one if the directory has none yet
	pub async fn load_or_generate(layout: &Layout) -> Result<Self, SyncError> {
		match Self::load(layout).await {
			Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
				info!("No shared secret in {}, generating one", layout.auth_file().display());
				let auth = Self::generate();
				auth.store(layout).await?;
				Ok(auth)
			}
			other => other,
		}
	}

	pub async fn store(&self, layout: &Layout) -> Result<(), SyncError> {
		let file = AuthFile { secret: STANDARD.encode(self.secret) };
		tokio::fs::write(layout.auth_file(), serde_json::to_string_pretty(&file)?).await?;
		Ok(())
	}

	/// Random nonce to send as a challenge
	pub fn nonce(&self) -> Vec<u8> {
		util::random_seed().to_vec()
	}

	/// Answer to a received challenge
	pub fn respond(&self, nonce: &[u8]) -> Vec<u8> {
		blake3::keyed_hash(&self.secret, nonce).as_bytes().to_vec()
	}

	/// Check the answer to a challenge we sent
	pub fn verify(&self, nonce: &[u8], response: &[u8]) -> bool {
		if nonce.len() != RANDOM_SEED_LENGTH || response.len() != blake3::OUT_LEN {
			return false;
		}
		blake3::keyed_hash(&self.secret, nonce) == *response
	}
}


// vim: ts=4
