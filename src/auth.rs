//! 令牌与哈希工具模块
//!
//! 令牌为结构化明文：`token_{userId}_{nanoseconds}_{salt}`，
//! 服务端不存储，校验仅做结构检查。密码哈希为 SHA-256 十六进制。

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::error;

/// 会话 ID 长度（字节），渲染为两倍长度的小写十六进制
const SESSION_ID_BYTES: usize = 32;

/// 计算 SHA-256 哈希，返回小写十六进制字符串
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// 生成登录令牌
///
/// 格式：`token_{userId}_{nanoseconds}_{salt}`，共四个下划线分隔字段。
pub fn generate_token(user_id: i32) -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    let salt = OsRng.next_u32();
    format!("token_{}_{}_{:08x}", user_id, nanos, salt)
}

/// 校验令牌结构，成功时返回其中的用户 ID
///
/// 要求：以 `token_` 开头，恰好四个下划线分隔字段，
/// 第二个字段为非空正整数。其余任何形状一律拒绝。
pub fn verify_token(token: &str) -> Option<i32> {
    if !token.starts_with("token_") {
        return None;
    }
    let fields: Vec<&str> = token.split('_').collect();
    if fields.len() != 4 {
        return None;
    }
    match fields[1].parse::<i32>() {
        Ok(user_id) if user_id > 0 => Some(user_id),
        _ => None,
    }
}

/// 铸造会话 ID：256 位强随机数的小写十六进制
///
/// CSPRNG 失败时回退到 UUID，但必须记录失败日志。
pub fn mint_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => {
            let mut out = String::with_capacity(SESSION_ID_BYTES * 2);
            for byte in bytes {
                out.push_str(&format!("{:02x}", byte));
            }
            out
        }
        Err(err) => {
            error!(error = %err, "CSPRNG failure, falling back to UUID session id");
            uuid::Uuid::new_v4().simple().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        // 性质：verify(generate(uid)) == Some(uid)
        for uid in [1, 42, i32::MAX] {
            let token = generate_token(uid);
            assert_eq!(verify_token(&token), Some(uid));
        }
    }

    #[test]
    fn token_shape_is_checked_exactly() {
        assert_eq!(verify_token("garbage"), None);
        assert_eq!(verify_token("token_"), None);
        assert_eq!(verify_token("token_1_2"), None);
        assert_eq!(verify_token("token_1_2_3_4"), None);
        assert_eq!(verify_token("token__123_abcd"), None);
        assert_eq!(verify_token("token_abc_123_abcd"), None);
        assert_eq!(verify_token("token_-5_123_abcd"), None);
        assert_eq!(verify_token("token_0_123_abcd"), None);
        assert_eq!(verify_token("token_7_1699999999_00ff00ff"), Some(7));
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn session_ids_are_hex_and_unique() {
        let a = mint_session_id();
        let b = mint_session_id();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
