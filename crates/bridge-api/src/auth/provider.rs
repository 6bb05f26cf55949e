//! OIDC provider metadata
//!
//! Fetches the discovery document and signing-key set from an issuer and
//! converts the JWKs into `jsonwebtoken` decoding keys. A [`ProviderMetadata`]
//! is an immutable snapshot; refresh builds a new one and swaps it in whole.

use std::collections::HashMap;
use std::time::Instant;

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::routing::single_joining_slash;

/// Path of the discovery document relative to the issuer
pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// Key id used for JWKs that do not carry one
const DEFAULT_KID: &str = "default";

/// OIDC discovery document (subset of fields we need)
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

/// JWKS document
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

/// Individual JWK key
#[derive(Debug, Deserialize)]
struct JwkKey {
    /// Key type (RSA, EC, OKP)
    kty: String,
    /// Key ID
    kid: Option<String>,
    /// Intended use; only signing keys are kept
    #[serde(rename = "use")]
    use_: Option<String>,
    /// RSA modulus (for RSA keys)
    n: Option<String>,
    /// RSA exponent (for RSA keys)
    e: Option<String>,
    /// Curve (for EC and OKP keys)
    crv: Option<String>,
    /// x coordinate (for EC and OKP keys)
    x: Option<String>,
    /// EC y coordinate (for EC keys)
    y: Option<String>,
}

/// Discovery endpoints plus the current signing keys of an issuer
pub struct ProviderMetadata {
    /// Issuer identifier exactly as the provider reports it
    pub issuer: String,
    /// Where browsers are sent to authenticate
    pub authorization_endpoint: Url,
    /// Where authorization codes are redeemed
    pub token_endpoint: Url,
    /// Where signing keys are published
    pub jwks_uri: Url,
    /// Signing keys indexed by kid
    keys: HashMap<String, DecodingKey>,
    /// When this snapshot was fetched
    pub fetched_at: Instant,
}

impl ProviderMetadata {
    /// Fetch the discovery document and signing keys of `issuer_url`
    pub async fn fetch(http_client: &reqwest::Client, issuer_url: &Url) -> Result<Self, Error> {
        let discovery_url = single_joining_slash(issuer_url.as_str(), DISCOVERY_PATH);

        debug!(url = %discovery_url, "Fetching OIDC discovery document");

        let discovery: DiscoveryDocument = http_client
            .get(&discovery_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Discovery(format!("failed to fetch OIDC discovery: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("invalid OIDC discovery response: {}", e)))?;

        // Validate issuer matches, tolerating a trailing slash on either side
        if discovery.issuer.trim_end_matches('/') != issuer_url.as_str().trim_end_matches('/') {
            return Err(Error::Discovery(format!(
                "issuer mismatch: expected {}, got {}",
                issuer_url, discovery.issuer
            )));
        }

        let authorization_endpoint =
            parse_endpoint("authorization_endpoint", &discovery.authorization_endpoint)?;
        let token_endpoint = parse_endpoint("token_endpoint", &discovery.token_endpoint)?;
        let jwks_uri = parse_endpoint("jwks_uri", &discovery.jwks_uri)?;

        debug!(url = %jwks_uri, "Fetching JWKS");

        let jwks: JwksDocument = http_client
            .get(jwks_uri.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Discovery(format!("failed to fetch JWKS: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("invalid JWKS response: {}", e)))?;

        let keys = decoding_keys(jwks)?;

        info!(
            issuer = %discovery.issuer,
            key_count = keys.len(),
            "Fetched OIDC provider metadata"
        );

        Ok(Self {
            issuer: discovery.issuer,
            authorization_endpoint,
            token_endpoint,
            jwks_uri,
            keys,
            fetched_at: Instant::now(),
        })
    }

    /// Signing key for a token header's kid.
    ///
    /// A token without a kid is only accepted when the set holds exactly one key.
    pub fn key(&self, kid: Option<&str>) -> Option<&DecodingKey> {
        match kid {
            Some(kid) => self.keys.get(kid),
            None if self.keys.len() == 1 => self.keys.values().next(),
            None => None,
        }
    }

    /// Number of usable signing keys
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

fn parse_endpoint(field: &str, value: &str) -> Result<Url, Error> {
    Url::parse(value)
        .map_err(|e| Error::Discovery(format!("invalid {} '{}': {}", field, value, e)))
}

/// Convert every usable signing JWK into a decoding key
fn decoding_keys(jwks: JwksDocument) -> Result<HashMap<String, DecodingKey>, Error> {
    let mut keys = HashMap::new();
    for jwk in jwks.keys {
        if jwk.use_.as_deref().is_some_and(|u| u != "sig") {
            continue;
        }
        if let Some(key) = jwk_to_decoding_key(&jwk)? {
            let kid = jwk.kid.unwrap_or_else(|| DEFAULT_KID.to_string());
            keys.insert(kid, key);
        }
    }

    if keys.is_empty() {
        return Err(Error::Discovery("no usable keys found in JWKS".into()));
    }

    Ok(keys)
}

/// Required JWK member, or a discovery error naming it
fn component<'a>(kty: &str, value: &'a Option<String>, name: &str) -> Result<&'a str, Error> {
    value
        .as_deref()
        .ok_or_else(|| Error::Discovery(format!("{} key missing '{}'", kty, name)))
}

/// Convert a JWK to a DecodingKey
fn jwk_to_decoding_key(jwk: &JwkKey) -> Result<Option<DecodingKey>, Error> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = component(&jwk.kty, &jwk.n, "n")?;
            let e = component(&jwk.kty, &jwk.e, "e")?;
            DecodingKey::from_rsa_components(n, e)
                .map(Some)
                .map_err(|e| Error::Discovery(format!("invalid RSA key: {}", e)))
        }
        "EC" => {
            let crv = component(&jwk.kty, &jwk.crv, "crv")?;
            let x = component(&jwk.kty, &jwk.x, "x")?;
            let y = component(&jwk.kty, &jwk.y, "y")?;
            match crv {
                "P-256" | "P-384" => DecodingKey::from_ec_components(x, y)
                    .map(Some)
                    .map_err(|e| Error::Discovery(format!("invalid EC {} key: {}", crv, e))),
                _ => {
                    warn!(crv = %crv, "Unsupported EC curve");
                    Ok(None)
                }
            }
        }
        "OKP" => {
            let crv = component(&jwk.kty, &jwk.crv, "crv")?;
            if crv != "Ed25519" {
                warn!(crv = %crv, "Unsupported OKP curve");
                return Ok(None);
            }
            let x = component(&jwk.kty, &jwk.x, "x")?;
            DecodingKey::from_ed_components(x)
                .map(Some)
                .map_err(|e| Error::Discovery(format!("invalid Ed25519 key: {}", e)))
        }
        kty => {
            warn!(kty = %kty, "Unsupported key type");
            Ok(None)
        }
    }
}
