//! Loads or generates the relay's own Ed25519 identity keypair, persisted as
//! a hex-encoded 32-byte seed next to the configuration file.

use anyhow::Context as _;
use camino::Utf8Path;
use rand::RngCore;
use relay_identity::Ed25519Credential;

pub fn load_or_generate(path: &Utf8Path) -> anyhow::Result<Ed25519Credential> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let bytes = hex::decode(contents.trim()).context("identity key file is not valid hex")?;
            let seed: [u8; 32] = bytes.try_into().map_err(|_| anyhow::anyhow!("identity key file is not 32 bytes"))?;
            Ok(Ed25519Credential::from_bytes(&seed))
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            let mut seed = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut seed);
            let credential = Ed25519Credential::from_bytes(&seed);

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("couldn't create {parent}"))?;
            }
            std::fs::write(path, hex::encode(seed)).with_context(|| format!("couldn't write identity key at {path}"))?;

            info!(identity = %credential.id(), "Generated a new relay identity");
            Ok(credential)
        }
        Err(error) => Err(anyhow::Error::new(error).context(format!("couldn't read identity key at {path}"))),
    }
}
