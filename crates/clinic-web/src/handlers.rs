//! HTTP处理器
//!
//! 所有响应都使用统一的信封：`{"status": "success" | "error", "response": ...}`。

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::NaiveDateTime;
use clinic_core::{CallerIdentity, ClinicError, Doctor, Slot, SlotType};
use clinic_workflow::{DoctorRegistration, PatientRegistration};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::server::AppState;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// HTTP层的错误包装，负责把 [`ClinicError`] 转换为错误信封
#[derive(Debug)]
pub struct ApiError(pub ClinicError);

impl From<ClinicError> for ApiError {
    fn from(err: ClinicError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            ClinicError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ClinicError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ClinicError::Forbidden(_) => StatusCode::FORBIDDEN,
            ClinicError::NotFound(_) => StatusCode::NOT_FOUND,
            ClinicError::Conflict(_) => StatusCode::CONFLICT,
            ClinicError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            ClinicError::Config(_)
            | ClinicError::Database(_)
            | ClinicError::Serialization(_)
            | ClinicError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // 内部细节只写日志
            error!("Internal error: {}", self.0);
            "Internal server error".to_string()
        } else {
            self.0.message()
        };

        let mut response = (status, Json(json!({ "status": "error", "response": message }))).into_response();
        if self.0.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

/// 成功信封
pub fn success<T: Serialize>(status: StatusCode, payload: T) -> Response {
    (status, Json(json!({ "status": "success", "response": payload }))).into_response()
}

/// 请求体解析失败按参数错误处理
pub fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError(ClinicError::InvalidArgument(rejection.body_text())))
}

fn path_param<T>(param: std::result::Result<Path<T>, PathRejection>) -> ApiResult<T> {
    param
        .map(|Path(value)| value)
        .map_err(|rejection| ApiError(ClinicError::InvalidArgument(rejection.body_text())))
}

// ========== 请求与响应模型 ==========

#[derive(Debug, Deserialize)]
pub struct CheckInRequest {
    pub ssn: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinQueueRequest {
    pub doctor_id: i64,
    pub patient_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SlotPatientRequest {
    pub slot_id: i64,
    pub patient_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    pub is_available: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateSlotRequest {
    pub doctor_id: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    #[serde(default)]
    pub slot_type: SlotType,
}

/// 医生列表中的条目
#[derive(Debug, Serialize)]
pub struct DoctorSummary {
    pub id: i64,
    pub name: String,
    pub specialties: Vec<String>,
    pub is_available: bool,
}

impl From<Doctor> for DoctorSummary {
    fn from(doctor: Doctor) -> Self {
        Self {
            id: doctor.id,
            name: doctor.name,
            specialties: doctor.specialties,
            is_available: doctor.is_available,
        }
    }
}

/// 可预约号源列表中的条目
#[derive(Debug, Serialize)]
pub struct SlotSummary {
    pub id: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub is_available: bool,
    pub doctor_id: i64,
}

impl From<Slot> for SlotSummary {
    fn from(slot: Slot) -> Self {
        Self {
            id: slot.id,
            start_time: slot.start_time,
            end_time: slot.end_time,
            is_available: slot.is_available,
            doctor_id: slot.doctor_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BookingConfirmation {
    pub appointment_time: NaiveDateTime,
    pub doctor_id: i64,
}

// ========== 基础 ==========

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ========== 患者 ==========

/// 签到
pub async fn check_in(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CheckInRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    let outcome = state.registry.check_in(&request.ssn).await?;
    Ok(success(StatusCode::OK, outcome.message()))
}

/// 医生列表
pub async fn list_doctors(State(state): State<AppState>) -> ApiResult<Response> {
    let doctors: Vec<DoctorSummary> = state
        .registry
        .list_doctors()
        .await?
        .into_iter()
        .map(DoctorSummary::from)
        .collect();
    Ok(success(StatusCode::OK, doctors))
}

// ========== 候诊队列 ==========

/// 加入队列
pub async fn join_queue(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: std::result::Result<Json<JoinQueueRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    let ticket = state.queue.join(request.doctor_id, request.patient_id, &caller).await?;
    Ok(success(StatusCode::CREATED, ticket))
}

/// 队列状态
pub async fn queue_status(
    State(state): State<AppState>,
    doctor_id: std::result::Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let doctor_id = path_param(doctor_id)?;
    let status = state.queue.status(doctor_id).await?;
    Ok(success(StatusCode::OK, status))
}

/// 叫下一位
pub async fn next_patient(
    State(state): State<AppState>,
    doctor_id: std::result::Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let doctor_id = path_param(doctor_id)?;
    let outcome = state.queue.advance(doctor_id).await?;
    Ok(success(StatusCode::OK, outcome))
}

// ========== 号源 ==========

/// 医生的可预约号源
pub async fn available_slots(
    State(state): State<AppState>,
    doctor_id: std::result::Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let doctor_id = path_param(doctor_id)?;
    let slots: Vec<SlotSummary> = state
        .slots
        .list_available(doctor_id)
        .await?
        .into_iter()
        .map(SlotSummary::from)
        .collect();
    Ok(success(StatusCode::OK, slots))
}

/// 预约号源
pub async fn book_slot(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: std::result::Result<Json<SlotPatientRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    let slot = state.slots.book(request.slot_id, request.patient_id, &caller).await?;
    Ok(success(
        StatusCode::OK,
        BookingConfirmation {
            appointment_time: slot.start_time,
            doctor_id: slot.doctor_id,
        },
    ))
}

/// 取消预约
pub async fn release_slot(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: std::result::Result<Json<SlotPatientRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    let slot = state.slots.release(request.slot_id, request.patient_id, &caller).await?;
    Ok(success(StatusCode::OK, slot))
}

/// 删除号源
pub async fn delete_slot(
    State(state): State<AppState>,
    slot_id: std::result::Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let slot_id = path_param(slot_id)?;
    state.slots.delete(slot_id).await?;
    Ok(success(StatusCode::OK, "Slot deleted"))
}

// ========== 医生 ==========

/// 切换出诊状态
pub async fn set_doctor_availability(
    State(state): State<AppState>,
    doctor_id: std::result::Result<Path<i64>, PathRejection>,
    payload: std::result::Result<Json<AvailabilityRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let doctor_id = path_param(doctor_id)?;
    let request = json_body(payload)?;
    let doctor = state.registry.set_availability(doctor_id, request.is_available).await?;
    Ok(success(
        StatusCode::OK,
        json!({ "doctor_id": doctor.id, "is_available": doctor.is_available }),
    ))
}

// ========== 管理 ==========

pub async fn dev_list_users(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(success(StatusCode::OK, state.registry.list_patients().await?))
}

pub async fn dev_add_user(
    State(state): State<AppState>,
    payload: std::result::Result<Json<PatientRegistration>, JsonRejection>,
) -> ApiResult<Response> {
    let registration = json_body(payload)?;
    let patient = state.registry.register_patient(registration).await?;
    Ok(success(StatusCode::CREATED, patient))
}

pub async fn dev_list_doctors(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(success(StatusCode::OK, state.registry.list_doctors().await?))
}

pub async fn dev_add_doctor(
    State(state): State<AppState>,
    payload: std::result::Result<Json<DoctorRegistration>, JsonRejection>,
) -> ApiResult<Response> {
    let registration = json_body(payload)?;
    let doctor = state.registry.register_doctor(registration).await?;
    Ok(success(StatusCode::CREATED, doctor))
}

pub async fn dev_list_slots(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(success(StatusCode::OK, state.slots.list_all().await?))
}

pub async fn dev_create_slot(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateSlotRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    let slot = state
        .slots
        .create_slot(request.doctor_id, request.start_time, request.end_time, request.slot_type)
        .await?;
    Ok(success(StatusCode::CREATED, slot))
}

/// 删除医生
pub async fn dev_delete_doctor(
    State(state): State<AppState>,
    doctor_id: std::result::Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let doctor_id = path_param(doctor_id)?;

    match state.registry.delete_doctor(doctor_id).await {
        Ok(()) => {
            info!("Doctor {} removed from roster", doctor_id);
            Ok(success(StatusCode::OK, "Doctor deleted"))
        }
        Err(e) => {
            warn!("Failed to delete doctor {}: {}", doctor_id, e);
            Err(e.into())
        }
    }
}
