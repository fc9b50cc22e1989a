//! 通用工具函数

use crate::error::{ClinicError, Result};

/// 规范化电话号码：去掉所有非数字字符，接受10位号码或带 "91" 国家码的12位号码
pub fn normalize_phone(phone: &str) -> Option<String> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();

    match digits.len() {
        10 => Some(digits),
        12 if digits.starts_with("91") => Some(digits[2..].to_string()),
        _ => None,
    }
}

/// 校验并规范化电话号码
pub fn validate_phone(phone: &str) -> Result<String> {
    normalize_phone(phone)
        .ok_or_else(|| ClinicError::InvalidArgument(format!("Invalid phone number: {}", phone)))
}

/// 分钟数的显示格式，例如 "15 minutes"
pub fn format_minutes(minutes: i64) -> String {
    format!("{} minutes", minutes)
}

/// 解析逗号分隔的专长列表
pub fn parse_specialties(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 专长列表存储为逗号分隔文本
pub fn join_specialties(specialties: &[String]) -> String {
    specialties.join(", ")
}

/// 校验SSN：非空，最多12个字符
pub fn validate_ssn(ssn: &str) -> Result<String> {
    let ssn = ssn.trim();
    if ssn.is_empty() || ssn.len() > 12 {
        return Err(ClinicError::InvalidArgument("SSN must be 1 to 12 characters".to_string()));
    }
    Ok(ssn.to_string())
}
