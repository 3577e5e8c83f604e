//! Credential materialization.
//!
//! Turns an encrypted `SshCredential` record into a `SecretBundle` that lives
//! only for one job. Plaintext is held in `secrecy::SecretString`, which zeroes
//! its buffer on drop and never prints its contents.

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::{CredentialError, DecryptError, ProvisionError};
use crate::models::{AuthMethod, SshCredential};

/// Decrypt capability supplied by the surrounding system.
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, DecryptError>;
}

/// Decrypts age ciphertext (armored or binary-as-text) with an X25519 identity.
pub struct AgeDecryptor {
    identity: age::x25519::Identity,
    source: PathBuf,
}

impl AgeDecryptor {
    pub fn new(identity: age::x25519::Identity) -> Self {
        AgeDecryptor {
            identity,
            source: PathBuf::new(),
        }
    }

    /// Load the first identity line from an age identity file.
    ///
    /// Comment lines (`#`) and blank lines are skipped.
    pub fn from_identity_file(path: &Path) -> Result<Self, DecryptError> {
        let mut contents = String::new();
        fs::File::open(path)
            .and_then(|mut f| f.read_to_string(&mut contents))
            .map_err(|e| {
                DecryptError::Identity(format!("failed to read {}: {}", path.display(), e))
            })?;

        let identity = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.starts_with('#') && !line.is_empty())
            .ok_or_else(|| {
                DecryptError::Identity(format!("identity file {} is empty", path.display()))
            })?
            .parse::<age::x25519::Identity>()
            .map_err(|e| DecryptError::Identity(format!("invalid identity: {}", e)))?;

        log::info!("[Credentials] Loaded age identity from {}", path.display());
        Ok(AgeDecryptor {
            identity,
            source: path.to_path_buf(),
        })
    }
}

impl fmt::Debug for AgeDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgeDecryptor")
            .field("source", &self.source)
            .field("identity", &"[REDACTED]")
            .finish()
    }
}

impl SecretDecryptor for AgeDecryptor {
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, DecryptError> {
        let armored = age::armor::ArmoredReader::new(ciphertext.as_bytes());
        let age::Decryptor::Recipients(decryptor) =
            age::Decryptor::new(armored).map_err(|e| DecryptError::Malformed(e.to_string()))?
        else {
            return Err(DecryptError::Malformed(
                "passphrase-encrypted secrets are not supported".to_string(),
            ));
        };

        let identity: &dyn age::Identity = &self.identity;
        let mut reader = decryptor
            .decrypt(std::iter::once(identity))
            .map_err(|e| DecryptError::NoMatchingIdentity(e.to_string()))?;

        let mut plaintext = zeroize::Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| DecryptError::Malformed(e.to_string()))?;

        let text = String::from_utf8(std::mem::take(&mut *plaintext))
            .map_err(|_| DecryptError::InvalidUtf8)?;
        Ok(SecretString::from(text))
    }
}

/// Passes stored values through unchanged. For development stores only.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextDecryptor;

impl SecretDecryptor for PlaintextDecryptor {
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, DecryptError> {
        Ok(SecretString::from(ciphertext.to_string()))
    }
}

/// How the external tool authenticates to every node.
pub enum SshAuth {
    PrivateKey {
        key: SecretString,
        passphrase: Option<SecretString>,
    },
    Password(SecretString),
}

impl SshAuth {
    pub fn method(&self) -> AuthMethod {
        match self {
            SshAuth::PrivateKey { .. } => AuthMethod::PrivateKey,
            SshAuth::Password(_) => AuthMethod::Password,
        }
    }
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SshAuth::{}([REDACTED])", self.method().as_str())
    }
}

/// Plaintext SSH credentials for one job execution.
pub struct SecretBundle {
    pub username: String,
    pub auth: SshAuth,
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("username", &self.username)
            .field("auth_method", &self.auth.method())
            .field("secrets", &"[REDACTED]")
            .finish()
    }
}

/// Decrypt the credential record for `cluster_id` into a `SecretBundle`.
///
/// Fails with `MissingCredential` when there is no record, and with a
/// `CredentialError` when the record holds no usable secret for its declared
/// auth method.
pub fn materialize(
    cluster_id: Uuid,
    credential: Option<&SshCredential>,
    decryptor: &dyn SecretDecryptor,
) -> Result<SecretBundle, ProvisionError> {
    let credential = credential.ok_or(ProvisionError::MissingCredential(cluster_id))?;

    let username = credential.username.trim();
    if username.is_empty() {
        return Err(CredentialError::EmptyUsername.into());
    }

    let auth = match credential.auth_method {
        AuthMethod::PrivateKey => {
            let key = decrypt_required(
                decryptor,
                credential.private_key_encrypted.as_deref(),
                "private key",
                AuthMethod::PrivateKey,
            )?;
            let passphrase = decrypt_optional(
                decryptor,
                credential.passphrase_encrypted.as_deref(),
                "passphrase",
            )?;
            SshAuth::PrivateKey { key, passphrase }
        }
        AuthMethod::Password => SshAuth::Password(decrypt_required(
            decryptor,
            credential.password_encrypted.as_deref(),
            "password",
            AuthMethod::Password,
        )?),
    };

    log::debug!(
        "[Credentials] Materialized {} credentials for cluster {}",
        auth.method().as_str(),
        cluster_id
    );
    Ok(SecretBundle {
        username: username.to_string(),
        auth,
    })
}

fn decrypt_required(
    decryptor: &dyn SecretDecryptor,
    ciphertext: Option<&str>,
    field: &'static str,
    method: AuthMethod,
) -> Result<SecretString, CredentialError> {
    decrypt_optional(decryptor, ciphertext, field)?.ok_or(CredentialError::MissingSecret {
        method: method.as_str(),
    })
}

fn decrypt_optional(
    decryptor: &dyn SecretDecryptor,
    ciphertext: Option<&str>,
    field: &'static str,
) -> Result<Option<SecretString>, CredentialError> {
    let Some(ciphertext) = ciphertext.filter(|c| !c.trim().is_empty()) else {
        return Ok(None);
    };
    let secret = decryptor
        .decrypt(ciphertext)
        .map_err(|source| CredentialError::Decrypt { field, source })?;
    if secret.expose_secret().trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(secret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn credential(method: AuthMethod) -> SshCredential {
        SshCredential {
            cluster_id: Uuid::nil(),
            username: "ops".to_string(),
            auth_method: method,
            private_key_encrypted: None,
            password_encrypted: None,
            passphrase_encrypted: None,
        }
    }

    #[test]
    fn test_missing_record_is_missing_credential() {
        let id = Uuid::new_v4();
        let err = materialize(id, None, &PlaintextDecryptor).unwrap_err();
        assert!(matches!(err, ProvisionError::MissingCredential(c) if c == id));
    }

    #[test]
    fn test_private_key_bundle() {
        let mut cred = credential(AuthMethod::PrivateKey);
        cred.private_key_encrypted = Some("-----BEGIN KEY-----".to_string());
        cred.passphrase_encrypted = Some("".to_string());
        let bundle = materialize(Uuid::nil(), Some(&cred), &PlaintextDecryptor).unwrap();
        assert_eq!(bundle.username, "ops");
        match bundle.auth {
            SshAuth::PrivateKey { key, passphrase } => {
                assert_eq!(key.expose_secret(), "-----BEGIN KEY-----");
                assert!(passphrase.is_none());
            }
            SshAuth::Password(_) => panic!("expected key auth"),
        }
    }

    #[test]
    fn test_declared_method_without_secret_fails() {
        let mut cred = credential(AuthMethod::Password);
        cred.private_key_encrypted = Some("a key, but wrong method".to_string());
        let err = materialize(Uuid::nil(), Some(&cred), &PlaintextDecryptor).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Credential(CredentialError::MissingSecret { method: "password" })
        ));
    }

    #[test]
    fn test_empty_username_rejected() {
        let mut cred = credential(AuthMethod::Password);
        cred.username = "  ".to_string();
        cred.password_encrypted = Some("pw".to_string());
        let err = materialize(Uuid::nil(), Some(&cred), &PlaintextDecryptor).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Credential(CredentialError::EmptyUsername)
        ));
    }

    #[test]
    fn test_bundle_debug_is_redacted() {
        let bundle = SecretBundle {
            username: "ops".to_string(),
            auth: SshAuth::Password(SecretString::from("hunter2".to_string())),
        };
        let rendered = format!("{:?}", bundle);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("hunter2"));
    }

    fn encrypt_armored(recipient: age::x25519::Recipient, plaintext: &str) -> String {
        let encryptor = age::Encryptor::with_recipients(vec![Box::new(recipient)]).unwrap();
        let mut out = vec![];
        let armor =
            age::armor::ArmoredWriter::wrap_output(&mut out, age::armor::Format::AsciiArmor)
                .unwrap();
        let mut writer = encryptor.wrap_output(armor).unwrap();
        writer.write_all(plaintext.as_bytes()).unwrap();
        writer.finish().unwrap().finish().unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_age_round_trip_and_wrong_identity() {
        let identity = age::x25519::Identity::generate();
        let ciphertext = encrypt_armored(identity.to_public(), "s3cret");

        let decryptor = AgeDecryptor::new(identity);
        let plain = decryptor.decrypt(&ciphertext).unwrap();
        assert_eq!(plain.expose_secret(), "s3cret");

        let other = AgeDecryptor::new(age::x25519::Identity::generate());
        assert!(matches!(
            other.decrypt(&ciphertext),
            Err(DecryptError::NoMatchingIdentity(_))
        ));
        assert!(decryptor.decrypt("not age at all").is_err());
    }

    #[test]
    fn test_identity_file_loading() {
        use age::secrecy::ExposeSecret as _;

        let identity = age::x25519::Identity::generate();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.txt");
        fs::write(
            &path,
            format!(
                "# created: test\n# public key: {}\n{}\n",
                identity.to_public(),
                identity.to_string().expose_secret()
            ),
        )
        .unwrap();

        let decryptor = AgeDecryptor::from_identity_file(&path).unwrap();
        let ciphertext = encrypt_armored(identity.to_public(), "pw");
        assert_eq!(decryptor.decrypt(&ciphertext).unwrap().expose_secret(), "pw");

        assert!(AgeDecryptor::from_identity_file(&dir.path().join("missing")).is_err());
    }
}
