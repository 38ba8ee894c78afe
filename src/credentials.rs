use anyhow::Result;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const ENV_PASSWORD: &str = "CMSYNC_PASSWORD";
const KEYRING_SERVICE: &str = "cmsync";

/// Where the password was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Environment,
    Keyring,
    File,
}

/// Password lookup for the CMS account: environment, then OS keyring, then
/// a private file in the config directory.
pub struct CredentialStore {
    username: String,
    password_file: PathBuf,
}

impl CredentialStore {
    pub fn new(username: &str) -> Self {
        let password_file = crate::config::Config::config_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(password_file_name(username));

        Self {
            username: username.to_string(),
            password_file,
        }
    }

    fn keyring_key(&self) -> String {
        format!("imap:{}", self.username)
    }

    fn env_password() -> Option<String> {
        env::var(ENV_PASSWORD).ok().filter(|s| !s.is_empty())
    }

    fn keyring_get(&self) -> Option<String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, &self.keyring_key()).ok()?;
        entry.get_password().ok()
    }

    fn keyring_set(&self, password: &str) -> bool {
        keyring::Entry::new(KEYRING_SERVICE, &self.keyring_key())
            .and_then(|entry| entry.set_password(password))
            .is_ok()
    }

    fn file_get(&self) -> Option<String> {
        fs::read_to_string(&self.password_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Write the fallback file, readable by the owner only
    fn file_set(&self, password: &str) -> Result<()> {
        if let Some(parent) = self.password_file.parent() {
            fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.password_file)?;
            file.write_all(password.as_bytes())?;
        }

        #[cfg(not(unix))]
        {
            let mut file = fs::File::create(&self.password_file)?;
            file.write_all(password.as_bytes())?;
        }

        Ok(())
    }

    pub fn get_password(&self) -> Result<(String, CredentialSource)> {
        if let Some(pwd) = Self::env_password() {
            return Ok((pwd, CredentialSource::Environment));
        }
        if let Some(pwd) = self.keyring_get() {
            return Ok((pwd, CredentialSource::Keyring));
        }
        if let Some(pwd) = self.file_get() {
            return Ok((pwd, CredentialSource::File));
        }

        anyhow::bail!(
            "Password for {} not found. Set {} or run 'cmsync login'.",
            self.username,
            ENV_PASSWORD
        )
    }

    /// Store in the keyring, falling back to the private file.
    pub fn set_password(&self, password: &str) -> Result<CredentialSource> {
        if self.keyring_set(password) && self.keyring_get().as_deref() == Some(password) {
            return Ok(CredentialSource::Keyring);
        }

        tracing::warn!("Keyring unavailable, storing password in {}", self.password_file.display());
        self.file_set(password)?;
        Ok(CredentialSource::File)
    }
}

fn password_file_name(username: &str) -> String {
    let safe: String = username
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '+' { c } else { '_' })
        .collect();
    format!(".password_{}", safe)
}
