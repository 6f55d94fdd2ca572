use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Datelike, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::log;
use crate::logging::LogLevel;

const CA_COMMON_NAME: &str = "safe-chain Root CA";
const CA_ORGANIZATION: &str = "safe-chain";
const ROOT_VALIDITY_YEARS: i32 = 10;
const LEAF_VALIDITY_YEARS: i32 = 1;

#[derive(Debug)]
pub enum CertError {
    Io(std::io::Error),
    Generation(rcgen::Error),
    Tls(rustls::Error),
    InvalidMaterial(String),
}

impl fmt::Display for CertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertError::Io(error) => write!(f, "certificate I/O failed: {}", error),
            CertError::Generation(error) => write!(f, "certificate generation failed: {}", error),
            CertError::Tls(error) => write!(f, "TLS configuration failed: {}", error),
            CertError::InvalidMaterial(reason) => {
                write!(f, "invalid certificate material: {}", reason)
            }
        }
    }
}

impl std::error::Error for CertError {}

impl From<std::io::Error> for CertError {
    fn from(value: std::io::Error) -> Self {
        CertError::Io(value)
    }
}

impl From<rcgen::Error> for CertError {
    fn from(value: rcgen::Error) -> Self {
        CertError::Generation(value)
    }
}

impl From<rustls::Error> for CertError {
    fn from(value: rustls::Error) -> Self {
        CertError::Tls(value)
    }
}

/// On-disk layout of the persistent CA material.
#[derive(Debug, Clone)]
pub struct CaPaths {
    pub dir: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub bundle: PathBuf,
}

impl CaPaths {
    pub fn under(dir: PathBuf) -> CaPaths {
        CaPaths {
            cert: dir.join("ca.pem"),
            key: dir.join("ca.key.pem"),
            bundle: dir.join("ca-bundle.pem"),
            dir,
        }
    }

    /// The conventional per-user location, `~/.safe-chain/`.
    pub fn default_user_paths() -> Option<CaPaths> {
        dirs::home_dir().map(|home| CaPaths::under(home.join(".safe-chain")))
    }
}

/// Root CA plus the per-host leaf cache. The root persists across
/// invocations; leaves live for the process lifetime only.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    paths: CaPaths,
    leaf_cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    /// Load the root CA from disk, or generate and persist a new one. A CA
    /// that cannot be loaded or written is fatal to the proxy.
    pub fn ensure_root(paths: CaPaths) -> Result<CertificateAuthority, CertError> {
        let (issuer, cert_pem, cert_der) = match (paths.cert.exists(), paths.key.exists()) {
            (true, true) => load_root(&paths)?,
            (false, false) => generate_root(&paths)?,
            _ => {
                return Err(CertError::InvalidMaterial(format!(
                    "partial CA material under {}: cert and key must both exist or both be absent",
                    paths.dir.display()
                )))
            }
        };
        Ok(CertificateAuthority {
            issuer,
            cert_pem,
            cert_der,
            paths,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn cert_path(&self) -> &Path {
        &self.paths.cert
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// A rustls server configuration presenting a leaf for `host`, minted
    /// under the root and memoized for the process lifetime.
    pub fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>, CertError> {
        let key = host.to_ascii_lowercase();
        if let Ok(cache) = self.leaf_cache.lock() {
            if let Some(config) = cache.get(&key) {
                return Ok(Arc::clone(config));
            }
        }

        let config = self.mint_leaf(&key)?;
        if let Ok(mut cache) = self.leaf_cache.lock() {
            // A concurrent minter may have won the race; first entry stays.
            return Ok(Arc::clone(
                cache.entry(key).or_insert_with(|| Arc::clone(&config)),
            ));
        }
        Ok(config)
    }

    fn mint_leaf(&self, host: &str) -> Result<Arc<ServerConfig>, CertError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());
        params.not_before = rcgen::date_time_ymd(Utc::now().year() - 1, 1, 1);
        params.not_after = rcgen::date_time_ymd(Utc::now().year() + LEAF_VALIDITY_YEARS, 1, 1);

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host.to_string());
        params.distinguished_name = distinguished_name;

        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(host.to_string().try_into()?));
        }

        let leaf_key = KeyPair::generate()?;
        let leaf_cert = params.signed_by(&leaf_key, &self.issuer)?;

        let chain = vec![leaf_cert.der().clone(), self.cert_der.clone()];
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    /// Write the CA bundle Python clients point at: the platform roots plus
    /// our own root, PEM-concatenated.
    pub fn write_combined_bundle(&self) -> Result<PathBuf, CertError> {
        let mut bundle = String::new();
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                for cert in certs {
                    bundle.push_str(&der_to_pem(cert.as_ref()));
                }
            }
            Err(error) => {
                log!(
                    LogLevel::Verbose,
                    "Could not load platform roots for the CA bundle: {}",
                    error
                );
            }
        }
        bundle.push_str(&self.cert_pem);
        write_atomically(&self.paths.bundle, bundle.as_bytes())?;
        Ok(self.paths.bundle.clone())
    }
}

/// Client-side TLS configuration for upstream registry connections,
/// verifying against the platform trust store with a bundled fallback.
pub fn upstream_client_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = roots.add(cert);
            }
        }
        Err(error) => {
            log!(
                LogLevel::Verbose,
                "Could not load platform trust roots: {}",
                error
            );
        }
    }
    if roots.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

type RootMaterial = (Issuer<'static, KeyPair>, String, CertificateDer<'static>);

fn generate_root(paths: &CaPaths) -> Result<RootMaterial, CertError> {
    let key = KeyPair::generate()?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    params.serial_number = Some(random_serial());
    params.not_before = rcgen::date_time_ymd(Utc::now().year() - 1, 1, 1);
    params.not_after = rcgen::date_time_ymd(Utc::now().year() + ROOT_VALIDITY_YEARS, 1, 1);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, CA_COMMON_NAME.to_string());
    distinguished_name.push(DnType::OrganizationName, CA_ORGANIZATION.to_string());
    params.distinguished_name = distinguished_name;

    let cert = params.self_signed(&key)?;
    let cert_pem = cert.pem();
    let cert_der = cert.der().clone();
    persist_root(paths, &cert_pem, &key.serialize_pem())?;
    Ok((Issuer::new(params, key), cert_pem, cert_der))
}

fn load_root(paths: &CaPaths) -> Result<RootMaterial, CertError> {
    let cert_pem = fs::read_to_string(&paths.cert)?;
    let key_pem = fs::read_to_string(&paths.key)?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        CertError::InvalidMaterial(format!(
            "failed to parse CA certificate {}: {}",
            paths.cert.display(),
            error
        ))
    })?;
    let key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
        CertError::InvalidMaterial(format!(
            "failed to derive issuer from {}: {}",
            paths.cert.display(),
            error
        ))
    })?;
    Ok((issuer, cert_pem, cert_der))
}

fn persist_root(
    paths: &CaPaths,
    cert_pem: &str,
    key_pem: &str,
) -> Result<(), CertError> {
    fs::create_dir_all(&paths.dir)?;
    write_atomically(&paths.cert, cert_pem.as_bytes())?;
    write_atomically(&paths.key, key_pem.as_bytes())?;
    Ok(())
}

/// Write via a sibling temp file plus rename so a crash never leaves a
/// half-written root behind.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), CertError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Keep the INTEGER positive.
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

fn der_to_pem(der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = String::with_capacity(encoded.len() + encoded.len() / 64 + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_paths(dir: &tempfile::TempDir) -> CaPaths {
        CaPaths::under(dir.path().join("state"))
    }

    #[test]
    fn generates_and_persists_root_on_first_run() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let paths = scratch_paths(&dir);
        let ca = CertificateAuthority::ensure_root(paths.clone()).expect("generate root");
        assert!(paths.cert.exists());
        assert!(paths.key.exists());
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn reloads_the_same_root_on_second_run() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let paths = scratch_paths(&dir);
        let first = CertificateAuthority::ensure_root(paths.clone()).expect("first root");
        let first_pem = first.cert_pem().to_string();
        drop(first);
        let second = CertificateAuthority::ensure_root(paths).expect("second root");
        assert_eq!(first_pem, second.cert_pem());
    }

    #[test]
    fn partial_material_is_rejected() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let paths = scratch_paths(&dir);
        fs::create_dir_all(&paths.dir).expect("create dir");
        fs::write(&paths.cert, "not a cert").expect("write stray cert");
        assert!(CertificateAuthority::ensure_root(paths).is_err());
    }

    #[test]
    fn leaf_configs_are_memoized_per_host() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let ca = CertificateAuthority::ensure_root(scratch_paths(&dir)).expect("root");
        let first = ca
            .server_config_for_host("registry.npmjs.org")
            .expect("first leaf");
        let second = ca
            .server_config_for_host("Registry.NPMJS.org")
            .expect("second leaf");
        assert!(Arc::ptr_eq(&first, &second));

        let other = ca
            .server_config_for_host("pypi.org")
            .expect("other host leaf");
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn combined_bundle_ends_with_our_root() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let ca = CertificateAuthority::ensure_root(scratch_paths(&dir)).expect("root");
        let bundle_path = ca.write_combined_bundle().expect("bundle");
        let bundle = fs::read_to_string(bundle_path).expect("read bundle");
        assert!(bundle.trim_end().ends_with(ca.cert_pem().trim_end()));
    }
}
