//! HS256 JSON Web Tokens carrying an [`RpcContext`].

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use ring::hmac;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::protocol::RpcContext;
use crate::{MeshError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
    alg: String,
    typ: String,
}

/// Registered claims plus the mesh identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshClaims {
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sock: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub router: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub routeid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockid: Option<String>,
}

impl MeshClaims {
    pub fn from_context(ctx: &RpcContext, lifetime: Duration) -> Self {
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::seconds(lifetime.as_secs() as i64);
        Self {
            iss: AuthConfig::JWT_ISSUER.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            sock: ctx.sock_name.clone(),
            router: ctx.is_router,
            routeid: ctx.route_id.clone(),
            conn: ctx.conn.clone(),
            blockid: ctx.block_id.clone(),
        }
    }

    pub fn into_context(self) -> RpcContext {
        RpcContext {
            route_id: self.routeid,
            sock_name: self.sock,
            conn: self.conn,
            block_id: self.blockid,
            is_router: self.router,
        }
    }
}

/// Signs and validates client tokens with one shared HMAC key.
#[derive(Debug, Clone)]
pub struct JwtSigner {
    key: hmac::Key,
}

impl JwtSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Create a signer with a fresh random key. Returns the key so it can be
    /// handed to processes that mint tokens.
    pub fn generate() -> (Self, Vec<u8>) {
        let mut secret = vec![0u8; AuthConfig::AUTH_KEY_LEN];
        rand::rng().fill_bytes(&mut secret);
        (Self::new(&secret), secret)
    }

    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let secret = hex::decode(secret_hex.trim())
            .map_err(|e| MeshError::config(format!("invalid auth key: {}", e)))?;
        if secret.is_empty() {
            return Err(MeshError::config("auth key cannot be empty"));
        }
        Ok(Self::new(&secret))
    }

    /// Mint a token for `ctx` with the default lifetime.
    pub fn make_client_token(&self, ctx: &RpcContext) -> Result<String> {
        self.sign_claims(&MeshClaims::from_context(ctx, AuthConfig::JWT_LIFETIME))
    }

    pub fn sign_claims(&self, claims: &MeshClaims) -> Result<String> {
        let header = JwtHeader {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?)
        );
        let tag = hmac::sign(&self.key, signing_input.as_bytes());
        Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    /// Verify signature, algorithm, issuer and expiry, then return the claims.
    pub fn validate_claims(&self, token: &str) -> Result<MeshClaims> {
        let (signing_input, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| MeshError::auth("malformed token"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| MeshError::auth("malformed token signature"))?;
        hmac::verify(&self.key, signing_input.as_bytes(), &signature)
            .map_err(|_| MeshError::auth("invalid token signature"))?;

        let (header, claims) = split_token(token)?;
        let header: JwtHeader = decode_segment(header)?;
        if header.alg != "HS256" {
            return Err(MeshError::auth(format!("unsupported token algorithm {}", header.alg)));
        }
        let claims: MeshClaims = decode_segment(claims)?;
        if claims.iss != AuthConfig::JWT_ISSUER {
            return Err(MeshError::auth("invalid token issuer"));
        }
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(MeshError::auth("token expired"));
        }
        Ok(claims)
    }

    /// Validate a token and return the context it carries.
    pub fn validate(&self, token: &str) -> Result<RpcContext> {
        Ok(self.validate_claims(token)?.into_context())
    }
}

fn split_token(token: &str) -> Result<(&str, &str)> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(claims), Some(_), None) => Ok((header, claims)),
        _ => Err(MeshError::auth("malformed token")),
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| MeshError::auth("malformed token segment"))?;
    serde_json::from_slice(&bytes).map_err(|e| MeshError::auth(format!("malformed token claims: {}", e)))
}

/// Read claims without checking the signature. Clients use this to find
/// the socket to dial; the router still validates on `authenticate`.
pub fn extract_unverified_claims(token: &str) -> Result<MeshClaims> {
    let (_, claims) = split_token(token)?;
    decode_segment(claims)
}

pub fn extract_unverified_rpc_context(token: &str) -> Result<RpcContext> {
    Ok(extract_unverified_claims(token)?.into_context())
}

pub fn extract_unverified_socket_name(token: &str) -> Result<String> {
    let claims = extract_unverified_claims(token)?;
    if claims.sock.is_empty() {
        return Err(MeshError::auth("no sock name in token"));
    }
    Ok(claims.sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_ctx() -> RpcContext {
        RpcContext::leaf("proc:1").with_sock_name("/tmp/mesh.sock")
    }

    #[test]
    fn test_sign_and_validate() {
        let (signer, _key) = JwtSigner::generate();
        let token = signer.make_client_token(&leaf_ctx()).unwrap();
        assert_eq!(token.split('.').count(), 3);
        assert_eq!(signer.validate(&token).unwrap(), leaf_ctx());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (signer, _) = JwtSigner::generate();
        let (other, _) = JwtSigner::generate();
        let token = signer.make_client_token(&leaf_ctx()).unwrap();
        assert!(matches!(
            other.validate(&token),
            Err(MeshError::Authentication { .. })
        ));
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let (signer, _) = JwtSigner::generate();
        let token = signer.make_client_token(&leaf_ctx()).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = MeshClaims::from_context(&RpcContext::router(), AuthConfig::JWT_LIFETIME);
        let forged = format!(
            "{}.{}.{}",
            parts[0],
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap()),
            parts[2]
        );
        assert!(signer.validate(&forged).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let signer = JwtSigner::new(b"secret");
        let mut claims = MeshClaims::from_context(&leaf_ctx(), AuthConfig::JWT_LIFETIME);
        claims.exp = chrono::Utc::now().timestamp() - 10;
        let token = signer.sign_claims(&claims).unwrap();
        let err = signer.validate(&token).unwrap_err();
        assert_eq!(err.to_string(), "Authentication error: token expired");
    }

    #[test]
    fn test_unverified_extraction() {
        let signer = JwtSigner::new(b"secret");
        let token = signer.make_client_token(&leaf_ctx()).unwrap();
        assert_eq!(extract_unverified_socket_name(&token).unwrap(), "/tmp/mesh.sock");
        assert_eq!(extract_unverified_rpc_context(&token).unwrap().route_id, "proc:1");
        assert!(extract_unverified_claims("not-a-token").is_err());
    }

    #[test]
    fn test_from_hex() {
        let signer = JwtSigner::from_hex("00112233445566778899aabbccddeeff").unwrap();
        let token = signer.make_client_token(&leaf_ctx()).unwrap();
        assert!(signer.validate(&token).is_ok());
        assert!(JwtSigner::from_hex("zz").is_err());
    }
}
