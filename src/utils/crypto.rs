// src/utils/crypto.rs

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub struct CryptoUtils;

impl CryptoUtils {
    /// 生成 128 位 API 密钥（32 位十六进制）
    pub fn generate_api_key() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// 生成浏览器会话令牌
    pub fn generate_session_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// 凭证摘要。查找与比较只使用摘要，避免按字节早退的计时差异
    pub fn digest(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    pub fn hash_password(password: &str) -> AppResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))?;
        Ok(hash.to_string())
    }

    pub fn verify_password(password: &str, hash: &str) -> bool {
        let parsed = match PasswordHash::new(hash) {
            Ok(h) => h,
            Err(_) => return false,
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// 证书指纹：DER 编码的小写十六进制 SHA-256
    pub fn cert_fingerprint(der: &[u8]) -> String {
        hex::encode(Sha256::digest(der))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_is_uuid() {
        let key = CryptoUtils::generate_api_key();
        assert!(Uuid::parse_str(&key).is_ok());
    }

    #[test]
    fn test_password_roundtrip() {
        let hash = CryptoUtils::hash_password("correct horse battery").unwrap();
        assert!(CryptoUtils::verify_password("correct horse battery", &hash));
        assert!(!CryptoUtils::verify_password("wrong", &hash));
    }

    #[test]
    fn test_verify_rejects_garbage_hash() {
        assert!(!CryptoUtils::verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(CryptoUtils::digest("abc"), CryptoUtils::digest("abc"));
        assert_ne!(CryptoUtils::digest("abc"), CryptoUtils::digest("abd"));
        assert_eq!(CryptoUtils::digest("abc").len(), 64);
    }
}
