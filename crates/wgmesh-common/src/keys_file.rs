// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{WgKeyPair, WgPrivateKey};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument};

pub const PRIVATE_KEY_FILENAME: &str = "privatekey";
pub const PUBLIC_KEY_FILENAME: &str = "publickey";

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("failed to access key file: {0}")]
	Io(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] crate::keys::KeyError),
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_wg_key_from_file(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let content = zeroize::Zeroizing::new(fs::read_to_string(path.as_ref()).await?);
	let private = WgPrivateKey::from_base64(content.trim())?;
	Ok(WgKeyPair::from_private_key(private))
}

async fn write_file(path: &Path, content: &str, mode: u32) -> Result<()> {
	#[cfg(unix)]
	{
		use tokio::fs::OpenOptions;
		use tokio::io::AsyncWriteExt;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(mode)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
	}

	#[cfg(not(unix))]
	{
		let _ = mode;
		fs::write(path, content).await?;
	}

	Ok(())
}

/// Writes `privatekey` (0600) and `publickey` (0644) into `key_dir`.
#[instrument(skip(key, key_dir), fields(dir = %key_dir.as_ref().display()))]
pub async fn save_wg_keys(key: &WgKeyPair, key_dir: impl AsRef<Path>) -> Result<()> {
	let key_dir = key_dir.as_ref();
	fs::create_dir_all(key_dir).await?;

	let private_b64 = key.private_key().to_base64();
	let content = zeroize::Zeroizing::new(format!("{}\n", private_b64.as_str()));
	write_file(&key_dir.join(PRIVATE_KEY_FILENAME), &content, 0o600).await?;

	let public = format!("{}\n", key.public_key());
	write_file(&key_dir.join(PUBLIC_KEY_FILENAME), &public, 0o644).await?;

	Ok(())
}

/// Loads the node's key pair from `key_dir`, generating and persisting one on first use.
///
/// The key must survive restarts: it is the peer identity other nodes route by.
#[instrument(skip_all, fields(dir = %key_dir.as_ref().display()))]
pub async fn get_or_create_keypair(key_dir: impl AsRef<Path>) -> Result<WgKeyPair> {
	let key_path = key_dir.as_ref().join(PRIVATE_KEY_FILENAME);

	if fs::try_exists(&key_path).await? {
		return load_wg_key_from_file(&key_path).await;
	}

	let keypair = WgKeyPair::generate();
	save_wg_keys(&keypair, key_dir.as_ref()).await?;
	info!(public_key = %keypair.public_key(), "generated new WireGuard key pair");
	Ok(keypair)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn save_and_load_key() {
		let temp_dir = TempDir::new().unwrap();

		let keypair = WgKeyPair::generate();
		save_wg_keys(&keypair, temp_dir.path()).await.unwrap();

		let loaded = load_wg_key_from_file(temp_dir.path().join(PRIVATE_KEY_FILENAME))
			.await
			.unwrap();
		assert_eq!(keypair.public_key(), loaded.public_key());

		let public = std::fs::read_to_string(temp_dir.path().join(PUBLIC_KEY_FILENAME)).unwrap();
		assert_eq!(public.trim(), keypair.public_key().to_base64());
	}

	#[tokio::test]
	#[cfg(unix)]
	async fn private_key_file_is_owner_only() {
		use std::os::unix::fs::PermissionsExt;

		let temp_dir = TempDir::new().unwrap();
		save_wg_keys(&WgKeyPair::generate(), temp_dir.path())
			.await
			.unwrap();

		let metadata = std::fs::metadata(temp_dir.path().join(PRIVATE_KEY_FILENAME)).unwrap();
		assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
	}

	#[tokio::test]
	async fn get_or_create_creates_nested_dir() {
		let temp_dir = TempDir::new().unwrap();
		let key_dir = temp_dir.path().join("wg0");

		let keypair = get_or_create_keypair(&key_dir).await.unwrap();
		assert!(key_dir.join(PRIVATE_KEY_FILENAME).exists());

		let again = get_or_create_keypair(&key_dir).await.unwrap();
		assert_eq!(keypair.public_key(), again.public_key());
	}

	#[tokio::test]
	async fn corrupt_key_file_is_an_error() {
		let temp_dir = TempDir::new().unwrap();
		std::fs::write(temp_dir.path().join(PRIVATE_KEY_FILENAME), "garbage\n").unwrap();

		let err = get_or_create_keypair(temp_dir.path()).await.unwrap_err();
		assert!(matches!(err, KeyFileError::InvalidFormat(_)));
	}
}
