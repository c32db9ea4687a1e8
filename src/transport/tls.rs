// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Builds a [`tokio_rustls::TlsConnector`] from the host's configured
//! CA/cert/key material (spec.md §4.1 "the connection wraps itself in a
//! TLS session using the host's CA/cert/key material before any command
//! is sent"). One connector is built per `IORuntime` at startup and
//! shared by every [`super::tcp::TcpTransport`] it owns.

use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use rustls::RootCertStore;
use rustls_pemfile::Item;
use tokio_rustls::TlsConnector;

use crate::cfg::config::TlsConfig;

/// Builds the connector once; handshake failures on individual connects
/// don't rebuild it, they just fall the `Connecting` state back through
/// its normal retry loop (spec §4.1 "TLS init failures fall back to
/// Connecting").
pub fn build_connector(cfg: &TlsConfig) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    match &cfg.ca_file {
        Some(path) => {
            let pem = fs::read(path)
                .with_context(|| format!("reading TLS CA file {}", path.display()))?;
            for item in rustls_pemfile::certs(&mut pem.as_slice()) {
                roots.add(item.context("invalid certificate in TLS CA file")?).context("adding CA cert")?;
            }
        },
        None => {
            let certs = rustls_native_certs::load_native_certs()
                .context("loading native CA certificates")?;
            for cert in certs {
                // Native-store entries are already well-formed; skip the
                // rare malformed one rather than refusing to start.
                let _ = roots.add(cert);
            }
        },
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

    let client_config = match (&cfg.cert_file, &cfg.key_file) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = fs::read(cert_path)
                .with_context(|| format!("reading TLS cert file {}", cert_path.display()))?;
            let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("invalid certificate in TLS cert file")?;

            let key_pem = fs::read(key_path)
                .with_context(|| format!("reading TLS key file {}", key_path.display()))?;
            let key = rustls_pemfile::read_one(&mut key_pem.as_slice())
                .context("invalid private key in TLS key file")?
                .and_then(|item| match item {
                    Item::Pkcs1Key(k) => Some(k.into()),
                    Item::Pkcs8Key(k) => Some(k.into()),
                    Item::Sec1Key(k) => Some(k.into()),
                    _ => None,
                })
                .context("TLS key file contains no recognizable private key")?;

            builder
                .with_client_auth_cert(certs, key)
                .context("building mutual-TLS client config")?
        },
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}
