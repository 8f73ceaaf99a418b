//! Certificate encoding helpers
//!
//! Some central systems deliver signed certificates as hex-encoded DER in
//! `CertificateSigned.cert[]`, or in `DataTransfer.data.cert[]` with
//! `messageId: "CertificateSigned"`. [`CertificatePemTransform`] rewrites those
//! to PEM before the handler runs.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::ocpp::dispatch::{BoxError, PayloadTransform};
use crate::ocpp::messages::{Action, OcppError};

const PEM_LINE: usize = 64;

/// Convert one hex-encoded DER certificate to PEM
pub fn der_hex_to_pem(hex_der: &str) -> Result<String, OcppError> {
    let cleaned: String = hex_der.chars().filter(|c| !c.is_whitespace()).collect();
    let der = hex::decode(&cleaned)
        .map_err(|e| OcppError::Collaborator(format!("certificate is not hex-encoded DER: {}", e)))?;
    if der.is_empty() {
        return Err(OcppError::Collaborator("empty certificate".to_string()));
    }

    let encoded = STANDARD.encode(der);
    let mut pem = String::with_capacity(encoded.len() + encoded.len() / PEM_LINE + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(PEM_LINE) {
        // base64 output is ASCII
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    Ok(pem)
}

fn convert_all(certs: &mut Value) -> Result<(), OcppError> {
    let Some(list) = certs.as_array_mut() else {
        return Err(OcppError::Collaborator("cert is not an array".to_string()));
    };
    for cert in list.iter_mut() {
        let hex = cert
            .as_str()
            .ok_or_else(|| OcppError::Collaborator("cert entry is not a string".to_string()))?;
        *cert = Value::String(der_hex_to_pem(hex)?);
    }
    Ok(())
}

/// Hex DER → PEM payload transform for certificate delivery
#[derive(Debug, Default, Clone, Copy)]
pub struct CertificatePemTransform;

impl CertificatePemTransform {
    /// Rewrite a payload in place; payloads without certificates are left alone
    pub fn apply(payload: &mut Value) -> Result<(), OcppError> {
        if let Some(certs) = payload.get_mut("cert") {
            return convert_all(certs);
        }

        if payload.get("messageId").and_then(Value::as_str) != Some("CertificateSigned") {
            return Ok(());
        }
        let Some(data) = payload.get_mut("data") else {
            return Ok(());
        };

        match data {
            Value::Object(map) => match map.get_mut("cert") {
                Some(certs) => convert_all(certs),
                None => Ok(()),
            },
            // 1.6 declares DataTransfer.data a string, so the object may arrive serialized
            Value::String(raw) => {
                let Ok(mut inner) = serde_json::from_str::<Value>(raw) else {
                    return Ok(());
                };
                if let Some(certs) = inner.get_mut("cert") {
                    convert_all(certs)?;
                    *raw = inner.to_string();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PayloadTransform for CertificatePemTransform {
    async fn transform(&self, _action: Action, mut payload: Value) -> Result<Value, BoxError> {
        Self::apply(&mut payload)?;
        Ok(payload)
    }
}
