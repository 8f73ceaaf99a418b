//! Certificate signing requests for the `SignCertificate` flow

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::ocpp::messages::OcppError;

/// Subject used for every generated request; `CN` is the charge point identity
const SUBJECT_PREFIX: &str = "/C=DE/ST=Hessen/L=Frankfurt/O=Ocpp-Simulator/OU=Ocpp-Simulator";

/// A fresh private key and the PEM request built from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csr {
    pub key: String,
    pub csr: String,
}

#[async_trait]
pub trait CsrGenerator: Send + Sync + 'static {
    /// Generate a key pair and a CSR whose common name is `subject`
    async fn generate_csr(&self, subject: &str) -> Result<Csr, OcppError>;
}

/// Shells out to the `openssl` command line tool
#[derive(Debug, Clone)]
pub struct OpensslCsrGenerator {
    program: PathBuf,
}

impl Default for OpensslCsrGenerator {
    fn default() -> Self {
        Self::new("openssl")
    }
}

impl OpensslCsrGenerator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, OcppError> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                OcppError::Collaborator(format!("failed to run {}: {}", self.program.display(), e))
            })?;

        if !output.status.success() {
            return Err(OcppError::Collaborator(format!(
                "{} {} exited with {}: {}",
                self.program.display(),
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| OcppError::Collaborator(format!("non UTF-8 output: {}", e)))
    }
}

#[async_trait]
impl CsrGenerator for OpensslCsrGenerator {
    async fn generate_csr(&self, subject: &str) -> Result<Csr, OcppError> {
        let key = self.run(&["genrsa", "2048"]).await?;

        // `req` reads the key from a file; it never outlives this call
        let key_file = tempfile::NamedTempFile::new()?;
        tokio::fs::write(key_file.path(), &key).await?;
        let key_path = key_file.path().to_string_lossy().into_owned();

        let subj = format!("{}/CN={}", SUBJECT_PREFIX, subject);
        let csr = self.run(&["req", "-new", "-key", &key_path, "-subj", &subj]).await?;
        debug!("Generated CSR for {}", subject);

        Ok(Csr { key, csr })
    }
}
