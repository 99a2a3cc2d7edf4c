use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    pin::Pin,
};

use anyhow::bail;
use concord_common::protocol::messages::TokenClaims;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<TokenClaims, TokenError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(#[source] jsonwebtoken::errors::Error),
    #[error("unknown tenant {0}")]
    UnknownTenant(String),
    #[error("token rejected: {0}")]
    Rejected(#[source] jsonwebtoken::errors::Error),
    #[error("token was issued for tenant {claimed}, not {expected}")]
    TenantMismatch { claimed: String, expected: String },
}

/// Reads claims without checking the signature. Only used to route the
/// request; the token is verified by the tenant afterwards.
pub fn decode_claims_unverified(token: &str) -> Result<TokenClaims, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(TokenError::Malformed)
}

/// Verifies tokens on behalf of a tenant.
pub trait TenantManager: Send + Sync {
    fn verify_token<'a>(&'a self, tenant_id: &'a str, token: &'a str) -> TokenFuture<'a>;
}

struct TenantKeys {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

/// Tenant manager backed by per-tenant HS256 shared secrets.
pub struct JwtTenantManager {
    tenants: HashMap<String, TenantKeys>,
    validation: Validation,
}

impl JwtTenantManager {
    pub fn new(secrets: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let mut tenants = HashMap::with_capacity(secrets.len());
        for (tenant_id, secret) in secrets {
            if secret.len() < 32 {
                bail!("secret for tenant '{tenant_id}' must be at least 32 characters long");
            }
            tenants.insert(
                tenant_id.clone(),
                TenantKeys {
                    encoding_key: EncodingKey::from_secret(secret.as_bytes()),
                    decoding_key: DecodingKey::from_secret(secret.as_bytes()),
                },
            );
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self { tenants, validation })
    }

    /// Signs claims with the secret of `claims.tenant_id`.
    pub fn issue_token(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        let keys = self
            .tenants
            .get(&claims.tenant_id)
            .ok_or_else(|| TokenError::UnknownTenant(claims.tenant_id.clone()))?;

        encode(&Header::new(Algorithm::HS256), claims, &keys.encoding_key)
            .map_err(TokenError::Malformed)
    }

    fn verify(&self, tenant_id: &str, token: &str) -> Result<TokenClaims, TokenError> {
        let keys =
            self.tenants.get(tenant_id).ok_or_else(|| TokenError::UnknownTenant(tenant_id.into()))?;

        let claims = decode::<TokenClaims>(token, &keys.decoding_key, &self.validation)
            .map_err(TokenError::Rejected)?
            .claims;

        if claims.tenant_id != tenant_id {
            return Err(TokenError::TenantMismatch {
                claimed: claims.tenant_id,
                expected: tenant_id.to_string(),
            });
        }

        Ok(claims)
    }
}

impl TenantManager for JwtTenantManager {
    fn verify_token<'a>(&'a self, tenant_id: &'a str, token: &'a str) -> TokenFuture<'a> {
        Box::pin(async move { self.verify(tenant_id, token) })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    use concord_common::protocol::messages::{TokenClaims, User};

    use super::JwtTenantManager;

    pub const TEST_TENANT: &str = "tenant-a";
    pub const TEST_SECRET: &str = "concord_test_secret_that_is_definitely_long_enough";

    pub fn tenant_manager() -> JwtTenantManager {
        JwtTenantManager::new(&BTreeMap::from([(TEST_TENANT.to_string(), TEST_SECRET.to_string())]))
            .expect("tenant manager should initialize")
    }

    pub fn now() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).expect("clock after epoch").as_secs() as i64
    }

    pub fn claims(document_id: &str, scopes: &[&str]) -> TokenClaims {
        let iat = now();
        TokenClaims {
            document_id: document_id.to_string(),
            tenant_id: TEST_TENANT.to_string(),
            scopes: scopes.iter().map(|scope| scope.to_string()).collect(),
            user: User { id: "user-1".to_string(), ..User::default() },
            iat,
            exp: iat + 3600,
        }
    }

    pub fn token(document_id: &str, scopes: &[&str]) -> String {
        tenant_manager().issue_token(&claims(document_id, scopes)).expect("token should be issued")
    }
}
