// src/utils/sanitize.rs

use crate::error::{AppError, AppResult};

const MAX_DEVICE_NAME_LEN: usize = 64;

/// 设备名清洗：去掉 HTML 敏感字符与控制字符，限制长度
pub fn sanitize_device_name(name: &str) -> AppResult<String> {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | '"' | '\'' | '&'))
        .collect();
    let cleaned = cleaned.trim().to_string();

    if cleaned.is_empty() {
        return Err(AppError::PairingInvalidName("name is empty".to_string()));
    }
    if cleaned.chars().count() > MAX_DEVICE_NAME_LEN {
        return Err(AppError::PairingInvalidName(format!(
            "name exceeds {} characters",
            MAX_DEVICE_NAME_LEN
        )));
    }
    Ok(cleaned)
}

/// 不可信输入进日志前替换控制字符，防止日志注入
pub fn sanitize_log_input(input: &str) -> String {
    let mut out: String = input
        .chars()
        .take(256)
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if input.chars().count() > 256 {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_html_chars() {
        assert_eq!(sanitize_device_name("<b>phone</b>").unwrap(), "bphone/b");
        assert_eq!(sanitize_device_name("Tom's \"Phone\"").unwrap(), "Toms Phone");
    }

    #[test]
    fn test_rejects_empty_after_cleaning() {
        assert!(sanitize_device_name("").is_err());
        assert!(sanitize_device_name("<>&").is_err());
        assert!(sanitize_device_name("   ").is_err());
    }

    #[test]
    fn test_rejects_overlong_name() {
        let long = "x".repeat(65);
        assert!(sanitize_device_name(&long).is_err());
        assert!(sanitize_device_name(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn test_log_input_replaces_newlines() {
        let out = sanitize_log_input("line1\nline2\r\x00");
        assert!(!out.contains('\n'));
        assert!(!out.contains('\r'));
        assert!(!out.contains('\x00'));
    }
}
