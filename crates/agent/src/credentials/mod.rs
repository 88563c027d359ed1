//! Ephemeral administrative credentials.
//!
//! The cluster-root CA lives in the machine configuration on the `STATE`
//! partition. Acquisition mounts that partition read-only inside a scoped
//! temp directory, extracts the CA certificate and key, and mints a
//! short-lived Ed25519 client certificate whose subject organization grants
//! administrative access at peer management APIs. Nothing is persisted; the
//! bundle lives for the duration of the process.

mod mount;
mod tls;

pub use tls::CredentialBundle;

use serde::Deserialize;

/// Subject organization that grants full administrative authorization at the
/// peer management API.
pub const ADMIN_ROLE: &str = "os:admin";

/// Relevant subset of the machine configuration document.
#[derive(Debug, Default, Deserialize)]
struct MachineConfig {
    #[serde(default)]
    machine: MachineSection,
}

#[derive(Debug, Default, Deserialize)]
struct MachineSection {
    #[serde(default)]
    ca: CaSection,
}

#[derive(Debug, Default, Deserialize)]
struct CaSection {
    #[serde(default)]
    crt: String,
    #[serde(default)]
    key: String,
}

/// CA material extracted from the machine configuration, still base64-wrapped.
#[derive(Debug)]
pub(crate) struct MachineCa {
    pub crt: String,
    pub key: String,
}

/// Acquire a fresh credential bundle from the node-local CA.
///
/// Failures here are fatal for the process: without the CA the agent cannot
/// authenticate probes to any machine other than itself.
pub fn acquire() -> Result<CredentialBundle, CredentialsError> {
    let ca = read_state_ca()?;
    CredentialBundle::generate(&ca.crt, &ca.key)
}

/// Read the CA from the `STATE` partition.
///
/// The mount is scoped to this call: the guard unmounts the partition and
/// removes the temporary mount point on every exit path.
fn read_state_ca() -> Result<MachineCa, CredentialsError> {
    let state = mount::StateMount::mount()?;

    let data = std::fs::read_to_string(state.config_path()).map_err(|e| {
        CredentialsError::StateUnavailable(format!(
            "failed to read {}: {}",
            state.config_path().display(),
            e
        ))
    })?;

    parse_machine_ca(&data)
}

/// Extract the base64 CA fields from machine config YAML.
fn parse_machine_ca(data: &str) -> Result<MachineCa, CredentialsError> {
    let config: MachineConfig = serde_yaml::from_str(data).map_err(|e| {
        CredentialsError::InvalidEncoding(format!("failed to parse machine config: {}", e))
    })?;

    if config.machine.ca.crt.is_empty() || config.machine.ca.key.is_empty() {
        return Err(CredentialsError::CaMissing);
    }

    Ok(MachineCa { crt: config.machine.ca.crt, key: config.machine.ca.key })
}

/// Errors raised while acquiring credentials. All of them are fatal.
#[derive(Debug)]
pub enum CredentialsError {
    /// The `STATE` partition could not be mounted or read.
    StateUnavailable(String),
    /// The machine configuration lacks `machine.ca.crt` or `machine.ca.key`.
    CaMissing,
    /// Base64, PEM or YAML decoding failed.
    InvalidEncoding(String),
    /// The CA private key uses an encoding or algorithm the agent cannot use.
    UnsupportedKey(String),
    /// Leaf certificate generation or signing failed.
    Certificate(String),
}

impl std::fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialsError::StateUnavailable(msg) => {
                write!(f, "STATE partition unavailable: {}", msg)
            },
            CredentialsError::CaMissing => {
                write!(f, "machine.ca.crt or machine.ca.key not found in machine config")
            },
            CredentialsError::InvalidEncoding(msg) => write!(f, "invalid CA encoding: {}", msg),
            CredentialsError::UnsupportedKey(msg) => write!(f, "unsupported CA key: {}", msg),
            CredentialsError::Certificate(msg) => {
                write!(f, "client certificate generation failed: {}", msg)
            },
        }
    }
}

impl std::error::Error for CredentialsError {}
