//! First-boot admin provisioning.
//!
//! When no admin account exists, one is created with a random password
//! written once to `admin-password.txt` (owner-read-only). The file is
//! never rewritten on later boots.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{info, warn};

use crate::error::{Result, UserError};
use crate::store::UserStore;

pub const ADMIN_EMAIL: &str = "admin@localhost";
const PASSWORD_FILE: &str = "admin-password.txt";
/// 18 random bytes → 24 base64 chars, above the 20-char floor.
const PASSWORD_BYTES: usize = 18;

/// Ensure an admin account exists. Returns the password file path when a
/// fresh admin was provisioned, `None` when one already existed.
pub fn ensure_admin(store: &UserStore, data_dir: &Path) -> Result<Option<PathBuf>> {
    if store.admin_exists()? {
        return Ok(None);
    }

    let password = generate_password()?;
    store.create_admin(ADMIN_EMAIL, &password)?;

    let path = data_dir.join(PASSWORD_FILE);
    write_owner_only(&path, &password)?;

    warn!(
        path = %path.display(),
        email = ADMIN_EMAIL,
        "bootstrap admin created — change this password immediately"
    );
    info!("admin password written once; it will not be shown again");
    Ok(Some(path))
}

fn generate_password() -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; PASSWORD_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| UserError::Crypto("password generation failed".to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(unix)]
fn write_owner_only(path: &Path, contents: &str) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    writeln!(file, "{contents}")?;
    Ok(())
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, contents: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    writeln!(file, "{contents}")?;
    Ok(())
}
