//! 访问网关：令牌签发与验证

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use clinic_core::{CallerIdentity, ClinicError, Patient, Result};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::handlers::{json_body, success, ApiError};
use crate::server::AppState;

/// 登录请求
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub ssn: String,
    pub phone: String,
}

/// 登录响应
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: Patient,
}

/// JWT Claims
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String, // 患者ID
    ssn: String,
    exp: usize, // 过期时间
    iat: usize, // 签发时间
    jti: String,
}

/// 访问网关
///
/// 无状态：令牌本身携带身份，验证只需要签名密钥。
pub struct AccessGate {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_ttl_hours: i64,
}

impl AccessGate {
    pub fn new(jwt_secret: &str, token_ttl_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            token_ttl_hours,
        }
    }

    /// 为患者签发令牌
    pub fn issue(&self, patient: &Patient) -> Result<String> {
        let iat = chrono::Utc::now().timestamp();
        let exp = self
            .token_ttl_hours
            .checked_mul(3600)
            .and_then(|secs| iat.checked_add(secs))
            .and_then(|exp| usize::try_from(exp).ok())
            .ok_or_else(|| ClinicError::Config(format!("Token lifetime out of range: {} hours", self.token_ttl_hours)))?;

        let claims = Claims {
            sub: patient.id.to_string(),
            ssn: patient.ssn.clone(),
            exp,
            iat: iat as usize,
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ClinicError::Internal(format!("Failed to encode token: {}", e)))
    }

    /// 验证令牌，得到调用者身份
    pub fn authenticate(&self, token: &str) -> Result<CallerIdentity> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default()).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => ClinicError::Unauthenticated("Token has expired".to_string()),
                _ => ClinicError::Unauthenticated("Invalid token".to_string()),
            }
        })?;

        let patient_id = data
            .claims
            .sub
            .parse::<i64>()
            .map_err(|_| ClinicError::Unauthenticated("Invalid token".to_string()))?;

        Ok(CallerIdentity {
            patient_id,
            ssn: data.claims.ssn,
        })
    }
}

/// 认证中间件
pub async fn auth_middleware(
    State(gate): State<Arc<AccessGate>>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    // 从请求头获取token
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ClinicError::Unauthenticated("Token is missing".to_string()))?;

    let caller = match gate.authenticate(token) {
        Ok(caller) => caller,
        Err(e) => {
            warn!("Rejected bearer token: {}", e);
            return Err(e.into());
        }
    };

    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

/// 登录处理器：SSN + 电话号码换取令牌
pub async fn login_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<LoginRequest>, axum::extract::rejection::JsonRejection>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let request = json_body(payload)?;

    let user = state.registry.authenticate(&request.ssn, &request.phone).await?;
    let token = state.gate.issue(&user)?;

    info!("Patient {} authenticated", user.id);
    Ok(success(axum::http::StatusCode::OK, LoginResponse { token, user }))
}
