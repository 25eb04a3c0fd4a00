//! Signing of transfer requests sent to the primary.
//!
//! A secondary attaches a [`TransferToken`] to every request. The token
//! binds the requesting site's name, the record being fetched and the
//! issue time with an HMAC-SHA256 signature over a secret shared by both
//! sites. The primary rejects tokens for another record, tokens with a bad
//! signature and tokens older than the configured expiry.

use crate::error::TransferError;
use chrono::{DateTime, Utc};
use georep_core::RecordId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Authorization attached to a transfer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferToken {
    /// Name of the requesting site.
    pub site: String,
    /// Record the request is for.
    pub model_record_id: RecordId,
    /// Issue time, Unix milliseconds.
    pub issued_at: i64,
    /// Hex-encoded HMAC-SHA256 signature.
    pub signature: String,
}

/// Creates and validates transfer tokens.
#[derive(Clone)]
pub struct RequestSigner {
    secret: Vec<u8>,
    expiry: Duration,
}

impl RequestSigner {
    /// Creates a signer with a 10 minute token expiry.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            expiry: Duration::from_secs(10 * 60),
        }
    }

    /// Sets the token expiry.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Signs a request for `model_record_id` on behalf of `site`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Unauthorized`] if the secret cannot key the
    /// MAC.
    pub fn sign(
        &self,
        site: &str,
        model_record_id: RecordId,
        now: DateTime<Utc>,
    ) -> Result<TransferToken, TransferError> {
        let issued_at = now.timestamp_millis();
        let mut mac = self.mac()?;
        mac.update(&signed_bytes(site, model_record_id, issued_at));
        Ok(TransferToken {
            site: site.to_string(),
            model_record_id,
            issued_at,
            signature: hex::encode(mac.finalize().into_bytes()),
        })
    }

    /// Validates `token` for a request on `model_record_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Unauthorized`] describing the first check
    /// that failed.
    pub fn validate(
        &self,
        token: &TransferToken,
        model_record_id: RecordId,
        now: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        if token.model_record_id != model_record_id {
            return Err(TransferError::Unauthorized("token is for another record".into()));
        }

        let signature = hex::decode(&token.signature)
            .map_err(|_| TransferError::Unauthorized("malformed signature".into()))?;
        let mut mac = self.mac()?;
        mac.update(&signed_bytes(&token.site, token.model_record_id, token.issued_at));
        mac.verify_slice(&signature)
            .map_err(|_| TransferError::Unauthorized("invalid signature".into()))?;

        let expiry_ms = i64::try_from(self.expiry.as_millis()).unwrap_or(i64::MAX);
        let age_ms = now.timestamp_millis().saturating_sub(token.issued_at);
        if age_ms > expiry_ms {
            return Err(TransferError::Unauthorized("token expired".into()));
        }
        Ok(())
    }

    fn mac(&self) -> Result<HmacSha256, TransferError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| TransferError::Unauthorized(format!("invalid signing key: {e}")))
    }
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("secret", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

fn signed_bytes(site: &str, model_record_id: RecordId, issued_at: i64) -> Vec<u8> {
    let mut data = Vec::with_capacity(site.len() + 17);
    data.extend_from_slice(site.as_bytes());
    data.push(0);
    data.extend_from_slice(&model_record_id.to_be_bytes());
    data.extend_from_slice(&issued_at.to_be_bytes());
    data
}
