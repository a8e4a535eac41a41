//! certificate chains for `x5c` signatures

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

use crate::error::{Error, IoResultExt, Result};

/// ca store name meaning the operating system's trust roots
pub const SYSTEM_STORE: &str = "_system_";

/// der certificates from a pem bundle, in file order
pub fn read_pem_certs(path: &Path) -> Result<Vec<Vec<u8>>> {
    let bytes = std::fs::read(path).with_path(path)?;
    pem_certs(&bytes).map_err(|e| Error::Signature(format!("{}: {e}", path.display())))
}

pub fn pem_certs(bytes: &[u8]) -> std::result::Result<Vec<Vec<u8>>, String> {
    let mut certs = Vec::new();
    for pem in Pem::iter_from_buffer(bytes) {
        let pem = pem.map_err(|e| format!("bad pem: {e}"))?;
        if pem.label == "CERTIFICATE" {
            certs.push(pem.contents);
        }
    }
    if certs.is_empty() {
        return Err("no certificate found".to_string());
    }
    Ok(certs)
}

/// `x5c` header entries: standard base64 der
pub fn encode_x5c(chain: &[Vec<u8>]) -> Vec<String> {
    chain.iter().map(|der| STANDARD.encode(der)).collect()
}

pub fn decode_x5c(entries: &[String]) -> Result<Vec<Vec<u8>>> {
    entries
        .iter()
        .map(|e| {
            STANDARD
                .decode(e)
                .map_err(|err| Error::Signature(format!("bad x5c entry: {err}")))
        })
        .collect()
}

/// trusted roots: a pem bundle, or the system store
pub fn load_roots(store: &str) -> Result<Vec<Vec<u8>>> {
    if store == SYSTEM_STORE {
        let loaded = rustls_native_certs::load_native_certs();
        for error in &loaded.errors {
            debug!(error = %error, "skipping unreadable system certificate");
        }
        if loaded.certs.is_empty() {
            return Err(Error::Signature("system trust store is empty".into()));
        }
        return Ok(loaded.certs.iter().map(|c| c.as_ref().to_vec()).collect());
    }
    read_pem_certs(Path::new(store))
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| Error::Signature(format!("bad certificate: {e}")))
}

/// whether `issuer` may sign certificates with `intermediates` ca
/// certificates between it and the leaf
///
/// chain members need `CA:TRUE`; configured roots only fail on an explicit
/// `CA:FALSE`, since v1 roots carry no extensions.
fn may_issue(issuer: &X509Certificate<'_>, intermediates: usize, anchor: bool) -> Result<()> {
    let refuse = |why: &str| Err(Error::Signature(format!("{} {why}", issuer.subject())));
    let constraints = issuer
        .basic_constraints()
        .map_err(|e| Error::Signature(format!("{}: {e}", issuer.subject())))?;
    match constraints {
        Some(ext) if !ext.value.ca => return refuse("is not a certificate authority"),
        None if !anchor => return refuse("is not a certificate authority"),
        Some(ext) => {
            if let Some(limit) = ext.value.path_len_constraint {
                if intermediates > limit as usize {
                    return refuse("exceeds its path length constraint");
                }
            }
        }
        None => {}
    }
    let usage = issuer
        .key_usage()
        .map_err(|e| Error::Signature(format!("{}: {e}", issuer.subject())))?;
    if usage.is_some_and(|ext| !ext.value.key_cert_sign()) {
        return refuse("may not sign certificates");
    }
    Ok(())
}

/// check `chain` (leaf first) up to one of `roots`; returns the leaf's
/// pkcs#1 public key
pub fn verify_chain(chain: &[Vec<u8>], roots: &[Vec<u8>]) -> Result<Vec<u8>> {
    let certs = chain
        .iter()
        .map(|der| parse(der))
        .collect::<Result<Vec<_>>>()?;
    let Some(leaf) = certs.first() else {
        return Err(Error::Signature("empty x5c chain".into()));
    };

    for cert in &certs {
        if !cert.validity().is_valid() {
            return Err(Error::Signature(format!(
                "certificate {} is expired or not yet valid",
                cert.subject()
            )));
        }
    }
    for (depth, pair) in certs.windows(2).enumerate() {
        let (child, issuer) = (&pair[0], &pair[1]);
        may_issue(issuer, depth, false)?;
        child.verify_signature(Some(issuer.public_key())).map_err(|e| {
            Error::Signature(format!("{} not signed by {}: {e}", child.subject(), issuer.subject()))
        })?;
    }

    let top = &certs[certs.len() - 1];
    let below_root = certs.len() - 1;
    let anchored = roots.iter().filter_map(|der| parse(der).ok()).any(|root| {
        root.subject() == top.issuer()
            && may_issue(&root, below_root, true).is_ok()
            && top.verify_signature(Some(root.public_key())).is_ok()
    });
    if !anchored {
        return Err(Error::Signature(format!(
            "no trusted root for issuer {}",
            top.issuer()
        )));
    }

    Ok(leaf.public_key().subject_public_key.data.to_vec())
}
