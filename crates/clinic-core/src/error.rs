//! 错误定义模块

use thiserror::Error;

/// 诊所系统统一错误类型
#[derive(Error, Debug)]
pub enum ClinicError {
    #[error("参数错误: {0}")]
    InvalidArgument(String),

    #[error("未认证: {0}")]
    Unauthenticated(String),

    #[error("权限错误: {0}")]
    Forbidden(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("冲突: {0}")]
    Conflict(String),

    /// 锁等待超时，调用方可以重试
    #[error("锁等待超时: {0}")]
    Timeout(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl ClinicError {
    /// 面向调用方的错误消息（不带分类前缀）
    pub fn message(&self) -> String {
        match self {
            ClinicError::InvalidArgument(msg)
            | ClinicError::Unauthenticated(msg)
            | ClinicError::Forbidden(msg)
            | ClinicError::NotFound(msg)
            | ClinicError::Conflict(msg)
            | ClinicError::Timeout(msg)
            | ClinicError::Config(msg)
            | ClinicError::Database(msg)
            | ClinicError::Internal(msg) => msg.clone(),
            ClinicError::Serialization(err) => err.to_string(),
        }
    }

    /// 是否可以安全重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClinicError::Timeout(_))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for ClinicError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                // unique_violation
                Some("23505") => {
                    return ClinicError::Conflict(format!(
                        "Duplicate record: {}",
                        db_err.constraint().unwrap_or("unique constraint")
                    ))
                }
                // foreign_key_violation
                Some("23503") => return ClinicError::NotFound("Referenced record not found".to_string()),
                // lock_not_available
                Some("55P03") => return ClinicError::Timeout("Timed out waiting for a row lock".to_string()),
                _ => {}
            }
        }

        ClinicError::Database(err.to_string())
    }
}

/// 诊所系统统一结果类型
pub type Result<T> = std::result::Result<T, ClinicError>;
