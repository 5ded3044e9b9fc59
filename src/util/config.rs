// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

//! Key material discovery (spec §4.D "Key material"): locates and, if
//! absent, generates the host's RSA keypair at `~/.android/adbkey[.pub]`,
//! the same path `adbd` and the reference `adb` client use.

use std::fs;
use std::path::PathBuf;

use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;

use crate::error::{AdbError, Result};
use crate::signer::RsaSigner;

const KEY_BITS: usize = 2048;

pub fn default_key_dir() -> PathBuf {
    if let Some(home) = dirs_next::home_dir() {
        return home.join(".android");
    }
    PathBuf::from(".android")
}

pub fn default_private_key_path() -> PathBuf {
    default_key_dir().join("adbkey")
}

pub fn default_public_key_path() -> PathBuf {
    default_key_dir().join("adbkey.pub")
}

/// Load the host's signing key from `~/.android/adbkey`, generating and
/// persisting a fresh keypair on first use.
pub fn load_or_generate_signer(comment: &str) -> Result<RsaSigner> {
    let private_path = default_private_key_path();
    if private_path.exists() {
        return RsaSigner::load_from_file(&private_path, comment);
    }

    let dir = default_key_dir();
    fs::create_dir_all(&dir)?;

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| AdbError::AuthenticationFailed(format!("generating RSA keypair: {e}")))?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AdbError::AuthenticationFailed(format!("encoding PKCS8 key: {e}")))?
        .to_string();

    let signer = RsaSigner::from_pkcs8_pem(&pem, comment)?;
    let public_blob = signer.public_key_blob()?;

    fs::write(&private_path, &pem)?;
    fs::write(default_public_key_path(), &public_blob)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(&private_path) {
            let mut perms = meta.permissions();
            perms.set_mode(0o600);
            let _ = fs::set_permissions(&private_path, perms);
        }
    }

    Ok(signer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_key_dir_is_dot_android_under_home() {
        let dir = default_key_dir();
        assert!(dir.ends_with(".android"));
    }
}
