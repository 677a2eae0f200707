/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const KEY_BITS: usize = 2048;

/// PEM-encoded RSA keypair of a local actor.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key_pem: String,
    pub private_key_pem: String,
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("FEDERA_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "federa", "Federa")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

pub fn generate_keypair(bits: usize) -> Result<KeyPair> {
    let priv_key = RsaPrivateKey::new(&mut OsRng, bits)?;
    keypair_from_private(&priv_key)
}

fn keypair_from_private(private_key: &RsaPrivateKey) -> Result<KeyPair> {
    let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public_key_pem = RsaPublicKey::from(private_key)
        .to_public_key_pem(LineEnding::LF)?
        .to_string();
    Ok(KeyPair {
        public_key_pem,
        private_key_pem,
    })
}

/// Key of the instance actor, used to sign fetches that no specific local actor performs.
/// Generated on first start and kept in the data dir.
pub fn load_or_generate_instance_key(dir: impl AsRef<Path>) -> Result<KeyPair> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("create data dir: {}", dir.display()))?;

    let priv_path = dir.join("instance_actor_key.pem");
    if priv_path.exists() {
        let pem = fs::read_to_string(&priv_path).with_context(|| format!("read {}", priv_path.display()))?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem).context("parse private key pem")?;
        return keypair_from_private(&private_key);
    }
    let pair = generate_keypair(KEY_BITS)?;
    fs::write(&priv_path, &pair.private_key_pem).with_context(|| format!("write {}", priv_path.display()))?;
    Ok(pair)
}
