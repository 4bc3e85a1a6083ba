//! Key material generation for the provisioner. Private keys are a
//! capability: generated here, returned once at session creation, and
//! never persisted by the session store (see the design notes on key
//! material lifetime).

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use rsa::pkcs1::ToRsaPrivateKey;
use rsa::{PublicKeyParts, RsaPrivateKey, RsaPublicKey};
use ssh_key::public::{KeyData, RsaPublicKey as SshRsaPublicKey};
use ssh_key::{Mpint, PublicKey as SshPublicKey};

/// Default RSA key size in bits, per the provisioner's key-material phase.
pub const DEFAULT_KEY_BITS: usize = 4096;

/// An in-memory RSA keypair produced for a single Session. The private key
/// is handed back to the caller exactly once and then dropped; only the
/// public key is retained on the Session record.
pub struct SessionKeyPair {
    pub private_key_pem: String,
    pub public_key_openssh: String,
}

/// Generates a fresh RSA keypair, encoding the private key as PKCS#1 PEM
/// and the public key in OpenSSH `authorized_keys` form.
pub fn generate_keypair(bits: usize) -> anyhow::Result<SessionKeyPair> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits)?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key.to_pkcs1_pem()?.to_string();
    let public_key_openssh = to_openssh_authorized_key(&public_key, "gpu-broker-session")?;

    Ok(SessionKeyPair {
        private_key_pem,
        public_key_openssh,
    })
}

fn to_openssh_authorized_key(public_key: &RsaPublicKey, comment: &str) -> anyhow::Result<String> {
    let ssh_public = SshRsaPublicKey {
        e: Mpint::try_from(public_key.e().to_bytes_be().as_slice())?,
        n: Mpint::try_from(public_key.n().to_bytes_be().as_slice())?,
    };
    let key = SshPublicKey::new(KeyData::Rsa(ssh_public), comment.to_string());
    Ok(key.to_openssh()?)
}

/// Generates a random opaque token for agent-mode heartbeat authentication.
pub fn generate_agent_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_pem_and_openssh_pair() {
        // Small key size purely to keep the test fast; production code
        // paths use DEFAULT_KEY_BITS.
        let pair = generate_keypair(1024).unwrap();
        assert!(pair.private_key_pem.contains("BEGIN RSA PRIVATE KEY"));
        assert!(pair.public_key_openssh.starts_with("ssh-rsa "));
    }

    #[test]
    fn agent_tokens_are_unique() {
        let a = generate_agent_token();
        let b = generate_agent_token();
        assert_eq!(a.len(), 48);
        assert_ne!(a, b);
    }
}
