// Copyright 2025 The EtcdProxy Controller Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509, X509Builder, X509Name, X509NameBuilder, X509Ref};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::net::IpAddr;
use time::{Duration, OffsetDateTime};

/// Source of the current time, injectable so certificate generation and
/// expiry filtering stay deterministic under test.
pub type Clock = fn() -> OffsetDateTime;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to generate certificate key"))]
    GenerateKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to serialize certificate bundle"))]
    SerializeBundle { source: openssl::error::ErrorStack },

    #[snafu(display("failed to parse certificate bundle"))]
    ParseBundle { source: openssl::error::ErrorStack },

    #[snafu(display("certificate bundle contains no certificates"))]
    EmptyBundle,

    #[snafu(display("private key does not match the first certificate in the bundle"))]
    KeyMismatch,

    #[snafu(display("bundle carries no private key to sign with"))]
    MissingSigningKey,

    #[snafu(display("unsupported private key type"))]
    UnsupportedKeyType,

    #[snafu(display("certificate validity is outside the representable range"))]
    ValidityOutOfRange { source: time::error::ComponentRange },
}

/// An ordered certificate chain plus an optional private key.
///
/// A keyless bundle is a trust bundle (CA pool). A bundle with a key is a
/// leaf bundle; the leaf is the first certificate by convention.
pub struct CertificateBundle {
    pub certificates: Vec<X509>,
    pub key: Option<PKey<Private>>,
}

impl CertificateBundle {
    /// Generates and self-signs a new CA certificate with the given common name.
    pub fn new_ca(
        common_name: &str,
        serial_number: i64,
        validity: Duration,
        current_time: Clock,
    ) -> Result<Self, Error> {
        let key = new_key_pair()?;
        let subject = common_name_entry(common_name)?;
        let serial = new_serial_number(serial_number)?;

        let cert = X509Builder::new()
            .and_then(|mut x509| {
                x509.set_version(2)?;
                x509.set_subject_name(&subject)?;
                x509.set_issuer_name(&subject)?;
                set_validity(&mut x509, validity, current_time)?;
                x509.set_serial_number(serial.as_ref())?;
                x509.set_pubkey(&key)?;
                x509.append_extension(BasicConstraints::new().critical().ca().build()?)?;
                x509.append_extension(
                    KeyUsage::new()
                        .critical()
                        .key_encipherment()
                        .digital_signature()
                        .key_cert_sign()
                        .build()?,
                )?;
                x509.sign(&key, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();

        Ok(Self {
            certificates: vec![cert],
            key: Some(key),
        })
    }

    /// Signs a new server certificate with this bundle's CA.
    ///
    /// etcd requires the serving key pair to authenticate as both server and
    /// client, so the leaf carries both extended key usages. The returned
    /// bundle is the leaf followed by this bundle's certificates.
    pub fn new_server_certificate(
        &self,
        common_name: &str,
        hosts: &[String],
        serial_number: i64,
        validity: Duration,
        current_time: Clock,
    ) -> Result<Self, Error> {
        let issuer_cert = self.leaf()?;
        let issuer_key = self.key.as_ref().context(MissingSigningKeySnafu)?;
        let key = new_key_pair()?;
        let subject = common_name_entry(common_name)?;
        let serial = new_serial_number(serial_number)?;
        let (ips, dns_names) = split_hosts(hosts);

        let cert = X509Builder::new()
            .and_then(|mut x509| {
                x509.set_version(2)?;
                x509.set_subject_name(&subject)?;
                x509.set_issuer_name(issuer_cert.subject_name())?;
                set_validity(&mut x509, validity, current_time)?;
                x509.set_serial_number(serial.as_ref())?;
                x509.set_pubkey(&key)?;
                x509.append_extension(
                    KeyUsage::new()
                        .critical()
                        .key_encipherment()
                        .digital_signature()
                        .build()?,
                )?;
                x509.append_extension(
                    ExtendedKeyUsage::new().server_auth().client_auth().build()?,
                )?;
                if !ips.is_empty() || !dns_names.is_empty() {
                    let mut subject_alt_name = SubjectAlternativeName::new();
                    for dns in &dns_names {
                        subject_alt_name.dns(dns);
                    }
                    for ip in &ips {
                        subject_alt_name.ip(&ip.to_string());
                    }
                    let subject_alt_name = subject_alt_name
                        .build(&x509.x509v3_context(Some(issuer_cert), None))?;
                    x509.append_extension(subject_alt_name)?;
                }
                x509.sign(issuer_key, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();

        let mut certificates = vec![cert];
        certificates.extend(self.certificates.iter().cloned());

        Ok(Self {
            certificates,
            key: Some(key),
        })
    }

    /// Signs a new client certificate with this bundle's CA. The returned
    /// bundle contains the leaf only; the CA is not embedded.
    pub fn new_client_certificate(
        &self,
        common_name: &str,
        serial_number: i64,
        validity: Duration,
        current_time: Clock,
    ) -> Result<Self, Error> {
        let issuer_cert = self.leaf()?;
        let issuer_key = self.key.as_ref().context(MissingSigningKeySnafu)?;
        let key = new_key_pair()?;
        let subject = common_name_entry(common_name)?;
        let serial = new_serial_number(serial_number)?;

        let cert = X509Builder::new()
            .and_then(|mut x509| {
                x509.set_version(2)?;
                x509.set_subject_name(&subject)?;
                x509.set_issuer_name(issuer_cert.subject_name())?;
                set_validity(&mut x509, validity, current_time)?;
                x509.set_serial_number(serial.as_ref())?;
                x509.set_pubkey(&key)?;
                x509.append_extension(
                    KeyUsage::new()
                        .critical()
                        .key_encipherment()
                        .digital_signature()
                        .build()?,
                )?;
                x509.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;
                x509.sign(issuer_key, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();

        Ok(Self {
            certificates: vec![cert],
            key: Some(key),
        })
    }

    /// Converts PEM bytes back into a bundle. The key is allowed to be empty
    /// because trust bundles are stored without one; when present it must
    /// match the first certificate.
    pub fn from_pem(cert_bytes: &[u8], key_bytes: &[u8]) -> Result<Self, Error> {
        let certificates = X509::stack_from_pem(cert_bytes).context(ParseBundleSnafu)?;
        ensure!(!certificates.is_empty(), EmptyBundleSnafu);

        let key = if key_bytes.is_empty() {
            None
        } else {
            let key = PKey::private_key_from_pem(key_bytes).context(ParseBundleSnafu)?;
            let leaf_key = certificates[0].public_key().context(ParseBundleSnafu)?;
            ensure!(leaf_key.public_eq(&key), KeyMismatchSnafu);
            Some(key)
        };

        Ok(Self { certificates, key })
    }

    /// Converts the bundle to PEM bytes. Certificates are concatenated as
    /// `CERTIFICATE` blocks in order; the key bytes are empty for keyless
    /// bundles.
    pub fn to_pem(&self) -> Result<(Vec<u8>, Vec<u8>), Error> {
        let mut cert_bytes = Vec::new();
        for cert in &self.certificates {
            cert_bytes.extend(cert.to_pem().context(SerializeBundleSnafu)?);
        }

        let key_bytes = match &self.key {
            None => Vec::new(),
            Some(key) => match key.id() {
                Id::RSA => key
                    .rsa()
                    .and_then(|rsa| rsa.private_key_to_pem())
                    .context(SerializeBundleSnafu)?,
                Id::EC => key
                    .ec_key()
                    .and_then(|ec| ec.private_key_to_pem())
                    .context(SerializeBundleSnafu)?,
                _ => return UnsupportedKeyTypeSnafu.fail(),
            },
        };

        Ok((cert_bytes, key_bytes))
    }

    pub fn leaf(&self) -> Result<&X509, Error> {
        self.certificates.first().context(EmptyBundleSnafu)
    }
}

/// Keeps only certificates that have not expired at the given time. May
/// return an empty vector; callers decide whether that is an error.
pub fn filter_expired(certificates: Vec<X509>, current_time: Clock) -> Vec<X509> {
    let now = current_time();
    certificates
        .into_iter()
        .filter(|cert| not_after(cert).map(|expiry| expiry > now).unwrap_or(false))
        .collect()
}

/// Returns the expiry timestamp of a certificate.
pub fn not_after(cert: &X509Ref) -> Result<OffsetDateTime, Error> {
    let epoch = Asn1Time::from_unix(0).context(BuildCertificateSnafu)?;
    let diff = epoch.diff(cert.not_after()).context(BuildCertificateSnafu)?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    OffsetDateTime::from_unix_timestamp(seconds).context(ValidityOutOfRangeSnafu)
}

/// Returns the subject common name of a certificate, or an empty string if
/// it carries none.
pub fn common_name(cert: &X509Ref) -> String {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|name| name.to_string())
        .unwrap_or_default()
}

fn new_key_pair() -> Result<PKey<Private>, Error> {
    Rsa::generate(2048)
        .and_then(PKey::try_from)
        .context(GenerateKeySnafu)
}

fn common_name_entry(common_name: &str) -> Result<X509Name, Error> {
    X509NameBuilder::new()
        .and_then(|mut name| {
            name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
            Ok(name)
        })
        .context(BuildCertificateSnafu)
        .map(X509NameBuilder::build)
}

fn new_serial_number(serial_number: i64) -> Result<Asn1Integer, Error> {
    BigNum::from_dec_str(&serial_number.to_string())
        .and_then(|bn| Asn1Integer::from_bn(&bn))
        .context(BuildCertificateSnafu)
}

// NotBefore is backdated by one second to tolerate clock skew between the
// controller and the certificate consumers.
fn set_validity(
    x509: &mut X509Builder,
    validity: Duration,
    current_time: Clock,
) -> Result<(), openssl::error::ErrorStack> {
    let now = current_time();
    let not_before = Asn1Time::from_unix((now - Duration::seconds(1)).unix_timestamp())?;
    let not_after = Asn1Time::from_unix((now + validity).unix_timestamp())?;
    x509.set_not_before(&not_before)?;
    x509.set_not_after(&not_after)?;
    Ok(())
}

// IP addresses are additionally included as DNS subjectAltNames, after the
// valid DNS entries, for clients that predate RFC 5280 handling.
fn split_hosts(hosts: &[String]) -> (Vec<IpAddr>, Vec<String>) {
    let mut ips = Vec::new();
    let mut dns_names = Vec::new();

    for host in hosts {
        match host.parse::<IpAddr>() {
            Ok(ip) => ips.push(ip),
            Err(_) => dns_names.push(host.clone()),
        }
    }

    for ip in &ips {
        dns_names.push(ip.to_string());
    }

    (ips, dns_names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn test_clock() -> OffsetDateTime {
        datetime!(2024-06-01 12:00 UTC)
    }

    fn new_test_ca() -> CertificateBundle {
        CertificateBundle::new_ca("test-signer", 42, Duration::days(365), test_clock)
            .expect("generating CA")
    }

    #[test]
    fn test_new_ca_is_self_signed() {
        let ca = new_test_ca();

        assert_eq!(ca.certificates.len(), 1);
        let cert = &ca.certificates[0];
        assert_eq!(common_name(cert), "test-signer");

        let key = ca.key.as_ref().expect("CA bundle should carry a key");
        assert!(cert.verify(key).expect("verifying self-signature"));

        let expiry = not_after(cert).expect("reading NotAfter");
        assert_eq!(expiry, test_clock() + Duration::days(365));
    }

    #[test]
    fn test_server_certificate_chains_to_ca() {
        let ca = new_test_ca();
        let server = ca
            .new_server_certificate(
                "etcd-test.ns.svc",
                &["etcd-test.ns.svc".to_string(), "10.0.0.1".to_string()],
                43,
                Duration::days(30),
                test_clock,
            )
            .expect("generating server certificate");

        assert_eq!(server.certificates.len(), 2);
        let leaf = &server.certificates[0];
        let ca_key = ca.certificates[0].public_key().expect("CA public key");
        assert!(leaf.verify(&ca_key).expect("verifying signature"));

        let names: Vec<String> = leaf
            .subject_alt_names()
            .expect("leaf should carry subjectAltName")
            .iter()
            .filter_map(|name| name.dnsname().map(str::to_string))
            .collect();
        assert!(names.contains(&"etcd-test.ns.svc".to_string()));
        assert!(names.contains(&"10.0.0.1".to_string()));
    }

    #[test]
    fn test_client_certificate_is_leaf_only() {
        let ca = new_test_ca();
        let client = ca
            .new_client_certificate("client-ns-secret", 44, Duration::days(30), test_clock)
            .expect("generating client certificate");

        assert_eq!(client.certificates.len(), 1);
        assert_eq!(common_name(&client.certificates[0]), "client-ns-secret");

        let ca_key = ca.certificates[0].public_key().expect("CA public key");
        assert!(client.certificates[0].verify(&ca_key).expect("verifying signature"));
    }

    #[test]
    fn test_pem_round_trip() {
        let ca = new_test_ca();
        let server = ca
            .new_server_certificate(
                "etcd-test.ns.svc",
                &["etcd-test.ns.svc".to_string()],
                45,
                Duration::days(30),
                test_clock,
            )
            .expect("generating server certificate");

        let (cert_bytes, key_bytes) = server.to_pem().expect("encoding PEM");
        assert!(!key_bytes.is_empty());

        let parsed = CertificateBundle::from_pem(&cert_bytes, &key_bytes).expect("parsing PEM");
        assert_eq!(parsed.certificates.len(), server.certificates.len());
        for (parsed_cert, original) in parsed.certificates.iter().zip(&server.certificates) {
            assert_eq!(
                parsed_cert.to_der().expect("encoding DER"),
                original.to_der().expect("encoding DER"),
            );
        }
        assert!(parsed.key.is_some());
    }

    #[test]
    fn test_parse_keyless_bundle() {
        let ca = new_test_ca();
        let trust = CertificateBundle {
            certificates: ca.certificates.clone(),
            key: None,
        };
        let (cert_bytes, key_bytes) = trust.to_pem().expect("encoding PEM");
        assert!(key_bytes.is_empty());

        let parsed = CertificateBundle::from_pem(&cert_bytes, &key_bytes).expect("parsing PEM");
        assert!(parsed.key.is_none());
        assert_eq!(parsed.certificates.len(), 1);
    }

    #[test]
    fn test_parse_rejects_mismatched_key() {
        let first = new_test_ca();
        let second = CertificateBundle::new_ca("other-signer", 46, Duration::days(365), test_clock)
            .expect("generating CA");

        let (cert_bytes, _) = first.to_pem().expect("encoding PEM");
        let (_, key_bytes) = second.to_pem().expect("encoding PEM");

        let result = CertificateBundle::from_pem(&cert_bytes, &key_bytes);
        assert!(matches!(result, Err(Error::KeyMismatch)));
    }

    #[test]
    fn test_filter_expired() {
        let ca = CertificateBundle::new_ca("short-lived", 47, Duration::hours(1), test_clock)
            .expect("generating CA");

        let kept = filter_expired(ca.certificates.clone(), test_clock);
        assert_eq!(kept.len(), 1);

        let kept = filter_expired(ca.certificates.clone(), OffsetDateTime::now_utc);
        assert!(kept.is_empty());
    }
}
