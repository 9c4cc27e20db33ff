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

use crate::context::Context;
use crate::reconcile::{Error, ValidityTooShortSnafu, aggregate, ensure};
use crate::types::v1alpha1::etcd_storage::{CertificateValidity, EtcdStorage, artifacts};
use crate::utils::certs::{self, CertificateBundle, Clock};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use openssl::x509::X509;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// Annotation carrying the RFC3339 expiry of the certificate the controller
/// issued into the object. Drives the rotation decision without parsing PEM
/// on every pass.
pub const CERTIFICATE_EXPIRY_ANNOTATION: &str = "etcd.xmudrii.com/certificate-expiry-date";

/// Annotation carrying the common name of the issuing CA; suppresses
/// duplicate appends into consumer trust bundles.
pub const CERTIFICATE_SIGNED_BY_ANNOTATION: &str = "etcd.xmudrii.com/certificate-signed-by";

pub const SERVING_CA_DATA_KEY: &str = "serving-ca.crt";
pub const CLIENT_CA_DATA_KEY: &str = "client-ca.crt";
pub const TLS_CERT_DATA_KEY: &str = "tls.crt";
pub const TLS_KEY_DATA_KEY: &str = "tls.key";

const DEFAULT_SIGNING_VALIDITY: Duration = Duration::days(5 * 365);
const DEFAULT_SERVING_VALIDITY: Duration = Duration::days(3 * 365);
const DEFAULT_CLIENT_VALIDITY: Duration = Duration::days(30);
const MINIMUM_VALIDITY: Duration = Duration::minutes(5);

/// Maintains the serving chain: the server certificate/key Secret in the
/// controller namespace, and the serving CA trust bundles fanned out to the
/// ConfigMaps named by the EtcdStorage spec.
///
/// A stale, missing or malformed server Secret triggers rotation: a new
/// serving CA is generated, a new leaf is issued and persisted, and the new
/// CA is appended (expired entries dropped) to every consumer bundle whose
/// `signed-by` annotation does not already name it. Consumer bundle failures
/// are collected per ConfigMap rather than short-circuiting the fan-out.
pub async fn ensure_server_certificates(
    etcdstorage: &EtcdStorage,
    ctx: &Context,
) -> Result<(), Error> {
    let current_time: Clock = OffsetDateTime::now_utc;
    let namespace = ctx.config.controller_namespace.clone();

    let mut secret = ctx
        .kube
        .get_secret(&namespace, &etcdstorage.server_cert_secret_name())
        .await?
        .unwrap_or_else(|| etcdstorage.new_server_cert_secret(&namespace));

    let mut bundle = parse_server_bundle(&secret);

    if bundle.is_none() || !is_fresh(&secret.metadata, current_time) {
        let signing_validity = resolve_validity(
            etcdstorage.spec.signing_certificate_validity,
            DEFAULT_SIGNING_VALIDITY,
        )?;
        let serving_validity = resolve_validity(
            etcdstorage.spec.serving_certificate_validity,
            DEFAULT_SERVING_VALIDITY,
        )?;

        let service_url = etcdstorage.service_url(&namespace);
        let signer_name = format!(
            "{}-server-signer-{}",
            service_url,
            current_time().unix_timestamp()
        );
        let serving_ca = CertificateBundle::new_ca(
            &signer_name,
            new_serial_number(current_time),
            signing_validity,
            current_time,
        )?;
        let server_cert = serving_ca.new_server_certificate(
            &service_url,
            std::slice::from_ref(&service_url),
            new_serial_number(current_time),
            serving_validity,
            current_time,
        )?;

        let (cert_bytes, key_bytes) = server_cert.to_pem()?;
        let annotations = secret.metadata.annotations.get_or_insert_default();
        annotations.insert(
            CERTIFICATE_EXPIRY_ANNOTATION.to_owned(),
            rfc3339(certs::not_after(server_cert.leaf()?)?),
        );
        annotations.insert(CERTIFICATE_SIGNED_BY_ANNOTATION.to_owned(), signer_name);
        secret.data = Some(
            [
                (TLS_CERT_DATA_KEY.to_owned(), ByteString(cert_bytes)),
                (TLS_KEY_DATA_KEY.to_owned(), ByteString(key_bytes)),
            ]
            .into(),
        );
        ensure::ensure_secret(ctx, &secret).await?;

        bundle = Some(server_cert);
    }

    let Some(issuer) = bundle.and_then(|bundle| bundle.certificates.get(1).cloned()) else {
        return Ok(());
    };
    let issuer_common_name = certs::common_name(&issuer);

    let mut errors = Vec::new();
    for destination in &etcdstorage.spec.ca_cert_config_maps {
        let mut config_map = match ctx
            .kube
            .get_config_map(&destination.namespace, &destination.name)
            .await
        {
            Ok(Some(config_map)) => config_map,
            Ok(None) => {
                errors.push(Error::ConfigMapNotFound {
                    name: destination.name.clone(),
                });
                continue;
            }
            Err(err) => {
                errors.push(err.into());
                continue;
            }
        };

        let already_appended = config_map
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(CERTIFICATE_SIGNED_BY_ANNOTATION))
            .is_some_and(|signer| signer == &issuer_common_name);
        if already_appended {
            continue;
        }

        let mut trust = parse_trust_bundle(config_map.data.as_ref(), SERVING_CA_DATA_KEY);
        trust.push(issuer.clone());
        let trust = certs::filter_expired(trust, current_time);

        let trust_bundle = CertificateBundle {
            certificates: trust,
            key: None,
        };
        let trust_pem = match trust_bundle.to_pem() {
            Ok((pem, _)) => pem,
            Err(err) => {
                errors.push(err.into());
                continue;
            }
        };

        config_map
            .metadata
            .annotations
            .get_or_insert_default()
            .insert(
                CERTIFICATE_SIGNED_BY_ANNOTATION.to_owned(),
                issuer_common_name.clone(),
            );
        config_map.data = Some(
            [(
                SERVING_CA_DATA_KEY.to_owned(),
                String::from_utf8(trust_pem).unwrap_or_default(),
            )]
            .into(),
        );

        if let Err(err) = ensure::ensure_config_map(ctx, &config_map).await {
            errors.push(err);
        }
    }

    match aggregate(errors) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Maintains the client chain: per consumer Secret named by the EtcdStorage
/// spec, a fresh client certificate signed by a per-pass signing CA whose
/// bundle lives in the controller-namespace client CA ConfigMap.
///
/// The signing CA is constructed lazily on the first stale Secret of the
/// pass and its private key is held only in memory for the remainder of the
/// pass. Per-Secret failures are collected rather than short-circuiting.
pub async fn ensure_client_certificates(
    etcdstorage: &EtcdStorage,
    ctx: &Context,
) -> Result<(), Error> {
    let current_time: Clock = OffsetDateTime::now_utc;
    let namespace = ctx.config.controller_namespace.clone();

    // The proxy mounts the client CA bundle even before any client
    // certificate is requested, so the ConfigMap must exist up front.
    if ctx
        .kube
        .get_config_map(&namespace, &etcdstorage.ca_config_map_name())
        .await?
        .is_none()
    {
        ctx.kube
            .create_config_map(&etcdstorage.new_client_ca_config_map(&namespace))
            .await?;
    }

    let mut signing_bundle: Option<CertificateBundle> = None;
    let mut errors = Vec::new();

    for destination in &etcdstorage.spec.client_cert_secrets {
        let secret = match ctx
            .kube
            .get_secret(&destination.namespace, &destination.name)
            .await
        {
            Ok(Some(secret)) => secret,
            Ok(None) => artifacts::new_client_cert_secret(destination),
            Err(err) => {
                errors.push(err.into());
                continue;
            }
        };

        if is_fresh(&secret.metadata, current_time) {
            continue;
        }

        if signing_bundle.is_none() {
            match rotate_client_signing_ca(etcdstorage, ctx, current_time).await {
                Ok(bundle) => signing_bundle = Some(bundle),
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            }
        }
        let Some(signing) = signing_bundle.as_ref() else {
            continue;
        };

        if let Err(err) = rotate_client_certificate(
            etcdstorage,
            ctx,
            &destination.namespace,
            &destination.name,
            signing,
            secret,
            current_time,
        )
        .await
        {
            errors.push(err);
        }
    }

    match aggregate(errors) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Generates the per-pass client signing CA and persists the refreshed trust
/// bundle (new CA first, expired entries dropped) into the client CA
/// ConfigMap. Returns the bundle carrying the signing key.
async fn rotate_client_signing_ca(
    etcdstorage: &EtcdStorage,
    ctx: &Context,
    current_time: Clock,
) -> Result<CertificateBundle, Error> {
    let namespace = ctx.config.controller_namespace.clone();
    let signing_validity = resolve_validity(
        etcdstorage.spec.signing_certificate_validity,
        DEFAULT_SIGNING_VALIDITY,
    )?;

    let service_url = etcdstorage.service_url(&namespace);
    let signer_name = format!(
        "{}-client-signer-{}",
        service_url,
        current_time().unix_timestamp()
    );
    let mut signing = CertificateBundle::new_ca(
        &signer_name,
        new_serial_number(current_time),
        signing_validity,
        current_time,
    )?;

    let mut config_map = ctx
        .kube
        .get_config_map(&namespace, &etcdstorage.ca_config_map_name())
        .await?
        .unwrap_or_else(|| etcdstorage.new_client_ca_config_map(&namespace));

    // The freshly generated CA cannot be expired, so it stays first and
    // remains the signer for the rest of the pass.
    signing
        .certificates
        .extend(parse_trust_bundle(config_map.data.as_ref(), CLIENT_CA_DATA_KEY));
    signing.certificates = certs::filter_expired(signing.certificates, current_time);

    let trust_bundle = CertificateBundle {
        certificates: signing.certificates.clone(),
        key: None,
    };
    let (trust_pem, _) = trust_bundle.to_pem()?;
    config_map.data = Some(
        [(
            CLIENT_CA_DATA_KEY.to_owned(),
            String::from_utf8(trust_pem).unwrap_or_default(),
        )]
        .into(),
    );
    ensure::ensure_config_map(ctx, &config_map).await?;

    Ok(signing)
}

async fn rotate_client_certificate(
    etcdstorage: &EtcdStorage,
    ctx: &Context,
    consumer_namespace: &str,
    secret_name: &str,
    signing: &CertificateBundle,
    mut secret: corev1::Secret,
    current_time: Clock,
) -> Result<(), Error> {
    let client_validity = resolve_validity(
        etcdstorage.spec.client_certificate_validity,
        DEFAULT_CLIENT_VALIDITY,
    )?;

    let common_name = format!("client-{consumer_namespace}-{secret_name}");
    let client_cert = signing.new_client_certificate(
        &common_name,
        new_serial_number(current_time),
        client_validity,
        current_time,
    )?;
    let (cert_bytes, key_bytes) = client_cert.to_pem()?;

    let annotations = secret.metadata.annotations.get_or_insert_default();
    annotations.insert(
        CERTIFICATE_EXPIRY_ANNOTATION.to_owned(),
        rfc3339(certs::not_after(client_cert.leaf()?)?),
    );
    annotations.insert(
        CERTIFICATE_SIGNED_BY_ANNOTATION.to_owned(),
        certs::common_name(signing.leaf()?),
    );
    secret.data = Some(
        [
            (TLS_CERT_DATA_KEY.to_owned(), ByteString(cert_bytes)),
            (TLS_KEY_DATA_KEY.to_owned(), ByteString(key_bytes)),
        ]
        .into(),
    );

    ensure::ensure_secret(ctx, &secret).await
}

/// A certificate object is fresh iff its expiry annotation parses as RFC3339
/// and lies in the future. Missing or malformed values force rotation.
fn is_fresh(metadata: &metav1::ObjectMeta, current_time: Clock) -> bool {
    metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(CERTIFICATE_EXPIRY_ANNOTATION))
        .and_then(|value| OffsetDateTime::parse(value, &Rfc3339).ok())
        .is_some_and(|expiry| expiry > current_time())
}

// The leaf and its issuer must both be present; anything less is treated as
// expired and rotated away.
fn parse_server_bundle(secret: &corev1::Secret) -> Option<CertificateBundle> {
    let data = secret.data.as_ref()?;
    let cert = data.get(TLS_CERT_DATA_KEY)?;
    let key = data.get(TLS_KEY_DATA_KEY)?;
    let bundle = CertificateBundle::from_pem(&cert.0, &key.0).ok()?;
    (bundle.certificates.len() >= 2).then_some(bundle)
}

// Unparseable or empty stored bundles count as empty rather than fatal.
fn parse_trust_bundle(data: Option<&BTreeMap<String, String>>, key: &str) -> Vec<X509> {
    data.and_then(|data| data.get(key))
        .filter(|pem| !pem.trim().is_empty())
        .and_then(|pem| CertificateBundle::from_pem(pem.as_bytes(), &[]).ok())
        .map(|bundle| bundle.certificates)
        .unwrap_or_default()
}

fn resolve_validity(
    configured: Option<CertificateValidity>,
    default: Duration,
) -> Result<Duration, Error> {
    let Some(validity) = configured else {
        return Ok(default);
    };

    let duration = Duration::seconds(i64::try_from(validity.0.as_secs()).unwrap_or(i64::MAX));
    if duration < MINIMUM_VALIDITY {
        return ValidityTooShortSnafu { validity: validity.0 }.fail();
    }
    Ok(duration)
}

// Serial uniqueness is not relied upon downstream; a 63-bit draw from a
// clock-seeded stream keeps collisions negligible.
fn new_serial_number(current_time: Clock) -> i64 {
    let seed = current_time().unix_timestamp_nanos() as u64;
    let mut rng = StdRng::seed_from_u64(seed);
    rng.random_range(0..i64::MAX)
}

fn rfc3339(timestamp: OffsetDateTime) -> String {
    timestamp.format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{FakeKube, WriteAction, create_test_etcd_storage, test_context};

    const CONTROLLER_NS: &str = "kube-apiserver-storage";
    const CONSUMER_NS: &str = "k8s-sample-apiserver";

    fn consumer_config_map(data: Option<BTreeMap<String, String>>) -> corev1::ConfigMap {
        corev1::ConfigMap {
            metadata: metav1::ObjectMeta {
                name: Some("etcd-serving-ca".to_owned()),
                namespace: Some(CONSUMER_NS.to_owned()),
                ..Default::default()
            },
            data,
            ..Default::default()
        }
    }

    fn consumer_secret(annotations: Option<BTreeMap<String, String>>) -> corev1::Secret {
        corev1::Secret {
            metadata: metav1::ObjectMeta {
                name: Some("etcd-client-cert".to_owned()),
                namespace: Some(CONSUMER_NS.to_owned()),
                annotations,
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_owned()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_server_rotation_populates_secret_and_trust_bundle() {
        let fake = FakeKube::shared();
        let es = create_test_etcd_storage();
        fake.seed_config_map(consumer_config_map(None));
        let ctx = test_context(fake.clone());

        ensure_server_certificates(&es, &ctx).await.unwrap();

        let secret = fake.secret(CONTROLLER_NS, "es-test-1-server-cert").unwrap();
        let annotations = secret.metadata.annotations.clone().unwrap();
        let expiry = annotations.get(CERTIFICATE_EXPIRY_ANNOTATION).unwrap();
        let expiry = OffsetDateTime::parse(expiry, &Rfc3339).unwrap();
        assert!(expiry > OffsetDateTime::now_utc());
        let signer = annotations.get(CERTIFICATE_SIGNED_BY_ANNOTATION).unwrap();
        assert!(
            signer.starts_with("etcd-es-test-1.kube-apiserver-storage.svc-server-signer-")
        );

        let data = secret.data.unwrap();
        let bundle = CertificateBundle::from_pem(
            &data.get(TLS_CERT_DATA_KEY).unwrap().0,
            &data.get(TLS_KEY_DATA_KEY).unwrap().0,
        )
        .unwrap();
        assert_eq!(bundle.certificates.len(), 2);
        assert_eq!(certs::common_name(&bundle.certificates[1]), *signer);

        let config_map = fake.config_map(CONSUMER_NS, "etcd-serving-ca").unwrap();
        let trust = parse_trust_bundle(config_map.data.as_ref(), SERVING_CA_DATA_KEY);
        assert_eq!(trust.len(), 1);
        assert_eq!(
            config_map
                .metadata
                .annotations
                .unwrap()
                .get(CERTIFICATE_SIGNED_BY_ANNOTATION),
            Some(signer)
        );
    }

    #[tokio::test]
    async fn test_server_pass_is_idempotent() {
        let fake = FakeKube::shared();
        let es = create_test_etcd_storage();
        fake.seed_config_map(consumer_config_map(None));
        let ctx = test_context(fake.clone());

        ensure_server_certificates(&es, &ctx).await.unwrap();
        fake.take_actions();

        ensure_server_certificates(&es, &ctx).await.unwrap();
        assert_eq!(fake.take_actions(), Vec::<WriteAction>::new());
    }

    #[tokio::test]
    async fn test_missing_consumer_config_map_is_aggregated() {
        let fake = FakeKube::shared();
        let es = create_test_etcd_storage();
        let ctx = test_context(fake.clone());

        let err = ensure_server_certificates(&es, &ctx).await.unwrap_err();
        assert!(
            err.to_string()
                .contains("configmaps \"etcd-serving-ca\" not found")
        );

        // The controller-namespace rotation itself still happened.
        assert!(fake.secret(CONTROLLER_NS, "es-test-1-server-cert").is_some());
    }

    #[tokio::test]
    async fn test_serving_ca_append_preserves_existing_entries() {
        let fake = FakeKube::shared();
        let es = create_test_etcd_storage();

        let pre_existing =
            CertificateBundle::new_ca("old-signer", 7, Duration::days(1), OffsetDateTime::now_utc)
                .unwrap();
        let (pre_existing_pem, _) = CertificateBundle {
            certificates: pre_existing.certificates.clone(),
            key: None,
        }
        .to_pem()
        .unwrap();
        fake.seed_config_map(consumer_config_map(Some(
            [(
                SERVING_CA_DATA_KEY.to_owned(),
                String::from_utf8(pre_existing_pem).unwrap(),
            )]
            .into(),
        )));

        let ctx = test_context(fake.clone());
        ensure_server_certificates(&es, &ctx).await.unwrap();

        let config_map = fake.config_map(CONSUMER_NS, "etcd-serving-ca").unwrap();
        let trust = parse_trust_bundle(config_map.data.as_ref(), SERVING_CA_DATA_KEY);
        assert_eq!(trust.len(), 2);

        // A further pass appends nothing; the signed-by annotation
        // short-circuits the fan-out.
        ensure_server_certificates(&es, &ctx).await.unwrap();
        let config_map = fake.config_map(CONSUMER_NS, "etcd-serving-ca").unwrap();
        let trust = parse_trust_bundle(config_map.data.as_ref(), SERVING_CA_DATA_KEY);
        assert_eq!(trust.len(), 2);
    }

    #[tokio::test]
    async fn test_client_rotation_on_expired_annotation() {
        let fake = FakeKube::shared();
        let es = create_test_etcd_storage();
        fake.seed_secret(consumer_secret(Some(
            [(
                CERTIFICATE_EXPIRY_ANNOTATION.to_owned(),
                "1970-01-01T00:00:00Z".to_owned(),
            )]
            .into(),
        )));

        let ctx = test_context(fake.clone());
        ensure_client_certificates(&es, &ctx).await.unwrap();

        let secret = fake.secret(CONSUMER_NS, "etcd-client-cert").unwrap();
        let annotations = secret.metadata.annotations.clone().unwrap();
        let expiry = annotations.get(CERTIFICATE_EXPIRY_ANNOTATION).unwrap();
        let expiry = OffsetDateTime::parse(expiry, &Rfc3339).unwrap();
        assert!(expiry > OffsetDateTime::now_utc());

        let data = secret.data.unwrap();
        let bundle = CertificateBundle::from_pem(
            &data.get(TLS_CERT_DATA_KEY).unwrap().0,
            &data.get(TLS_KEY_DATA_KEY).unwrap().0,
        )
        .unwrap();
        assert_eq!(
            certs::common_name(&bundle.certificates[0]),
            "client-k8s-sample-apiserver-etcd-client-cert"
        );

        // The signing CA landed in the controller-namespace trust bundle.
        let config_map = fake.config_map(CONTROLLER_NS, "es-test-1-ca-cert").unwrap();
        let trust = parse_trust_bundle(config_map.data.as_ref(), CLIENT_CA_DATA_KEY);
        assert_eq!(trust.len(), 1);
        assert_eq!(
            Some(&certs::common_name(&trust[0])),
            annotations.get(CERTIFICATE_SIGNED_BY_ANNOTATION)
        );
    }

    #[tokio::test]
    async fn test_fresh_client_secret_is_left_alone() {
        let fake = FakeKube::shared();
        let es = create_test_etcd_storage();
        fake.seed_secret(consumer_secret(Some(
            [(
                CERTIFICATE_EXPIRY_ANNOTATION.to_owned(),
                "2999-01-01T00:00:00Z".to_owned(),
            )]
            .into(),
        )));

        let ctx = test_context(fake.clone());
        ensure_client_certificates(&es, &ctx).await.unwrap();

        // Only the client CA ConfigMap shell is created; no signing CA is
        // generated and the fresh Secret stays untouched.
        assert_eq!(
            fake.take_actions(),
            vec![WriteAction::Create {
                kind: "configmaps",
                namespace: CONTROLLER_NS.to_owned(),
                name: "es-test-1-ca-cert".to_owned(),
            }]
        );
    }

    #[tokio::test]
    async fn test_validity_below_minimum_is_rejected() {
        let result = resolve_validity(
            Some(CertificateValidity(std::time::Duration::from_secs(60))),
            DEFAULT_CLIENT_VALIDITY,
        );
        assert!(matches!(result, Err(Error::ValidityTooShort { .. })));

        let resolved = resolve_validity(None, DEFAULT_CLIENT_VALIDITY).unwrap();
        assert_eq!(resolved, DEFAULT_CLIENT_VALIDITY);
    }
}
