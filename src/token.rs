//! 附件下载令牌
//!
//! 令牌格式：`base64url(claim_json).base64url(hmac_sha256(secret, claim_json))`，
//! claim 为 `{attachmentId, userId, expiresAt}`（expiresAt 为毫秒时间戳）。
//! 校验顺序：格式 → 签名（常数时间比较）→ 过期。

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::config::TokenSection;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed download token")]
    InvalidFormat,

    #[error("Download token signature mismatch")]
    BadSignature,

    #[error("Download token expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadClaim {
    pub attachment_id: String,
    pub user_id: String,
    pub expires_at: i64,
}

/// HMAC-SHA256 令牌签发 / 校验器
#[derive(Clone)]
pub struct DownloadTokenSigner {
    secret: Vec<u8>,
    ttl_ms: i64,
}

impl std::fmt::Debug for DownloadTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTokenSigner")
            .field("ttl_ms", &self.ttl_ms)
            .finish_non_exhaustive()
    }
}

impl DownloadTokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: std::time::Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl_ms: ttl.as_millis().min(i64::MAX as u128) as i64,
        }
    }

    /// 未配置密钥时随机生成 32 字节
    pub fn from_config(cfg: &TokenSection) -> Self {
        let secret = match cfg.secret.as_deref() {
            Some(s) if !s.is_empty() => s.as_bytes().to_vec(),
            _ => {
                tracing::warn!("No token secret configured, generated an ephemeral one");
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            }
        };
        Self::new(secret, std::time::Duration::from_secs(cfg.ttl_secs))
    }

    fn mac(&self) -> HmacSha256 {
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac accepts keys of any length"),
        }
    }

    pub fn issue(&self, attachment_id: &str, user_id: &str) -> String {
        self.issue_at(attachment_id, user_id, chrono::Utc::now().timestamp_millis())
    }

    fn issue_at(&self, attachment_id: &str, user_id: &str, now_ms: i64) -> String {
        let claim = DownloadClaim {
            attachment_id: attachment_id.to_string(),
            user_id: user_id.to_string(),
            expires_at: now_ms.saturating_add(self.ttl_ms),
        };
        let payload = serde_json::to_vec(&claim).unwrap_or_default();
        let mut mac = self.mac();
        mac.update(&payload);
        let sig = mac.finalize().into_bytes();
        format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), URL_SAFE_NO_PAD.encode(sig))
    }

    pub fn verify(&self, token: &str) -> Result<DownloadClaim, TokenError> {
        self.verify_at(token, chrono::Utc::now().timestamp_millis())
    }

    fn verify_at(&self, token: &str, now_ms: i64) -> Result<DownloadClaim, TokenError> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or(TokenError::InvalidFormat)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::InvalidFormat)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::InvalidFormat)?;

        let mut mac = self.mac();
        mac.update(&payload);
        mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

        let claim: DownloadClaim =
            serde_json::from_slice(&payload).map_err(|_| TokenError::InvalidFormat)?;
        if claim.expires_at <= now_ms {
            return Err(TokenError::Expired);
        }
        Ok(claim)
    }
}
