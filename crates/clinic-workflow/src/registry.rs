//! 患者和医生名册
//!
//! 注册、身份核验、签到和医生出诊状态。SSN唯一性由存储保证，这里的查询
//! 只用于给出更友好的错误。

use std::sync::Arc;

use clinic_core::utils::{normalize_phone, validate_phone, validate_ssn};
use clinic_core::{ClinicError, ClinicStore, Doctor, NewDoctor, NewPatient, Patient, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 签到结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInOutcome {
    CheckedIn,
    AlreadyCheckedIn,
}

impl CheckInOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            CheckInOutcome::CheckedIn => "Checked in",
            CheckInOutcome::AlreadyCheckedIn => "User already checked in",
        }
    }
}

/// 患者注册请求
#[derive(Debug, Clone, Deserialize)]
pub struct PatientRegistration {
    pub ssn: String,
    pub name: String,
    pub phone: String,
}

/// 医生注册请求
#[derive(Debug, Clone, Deserialize)]
pub struct DoctorRegistration {
    pub ssn: String,
    pub name: String,
    pub specialties: Vec<String>,
    pub experience: i32,
    pub opd_rate: f64,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(ClinicError::InvalidArgument("Name must be 1 to 100 characters".to_string()));
    }
    Ok(name.to_string())
}

/// 名册服务
pub struct Registry {
    store: Arc<dyn ClinicStore>,
}

impl Registry {
    pub fn new(store: Arc<dyn ClinicStore>) -> Self {
        Self { store }
    }

    /// 注册患者
    pub async fn register_patient(&self, registration: PatientRegistration) -> Result<Patient> {
        let patient = NewPatient {
            ssn: validate_ssn(&registration.ssn)?,
            name: validate_name(&registration.name)?,
            phone: validate_phone(&registration.phone)?,
        };

        let created = self.store.insert_patient(patient).await?;
        info!("Registered patient {} ({})", created.id, created.name);
        Ok(created)
    }

    /// 用SSN和电话号码核验患者身份
    pub async fn authenticate(&self, ssn: &str, phone: &str) -> Result<Patient> {
        let patient = self
            .store
            .find_patient_by_ssn(ssn.trim())
            .await?
            .ok_or_else(|| ClinicError::NotFound("User not registered".to_string()))?;

        if normalize_phone(phone).as_deref() != Some(patient.phone.as_str()) {
            warn!("Phone mismatch for patient {}", patient.id);
            return Err(ClinicError::Unauthenticated(
                "Incorrect phone number associated with ssn".to_string(),
            ));
        }

        Ok(patient)
    }

    /// 签到；重复签到不是错误
    pub async fn check_in(&self, ssn: &str) -> Result<CheckInOutcome> {
        let patient = self
            .store
            .find_patient_by_ssn(ssn.trim())
            .await?
            .ok_or_else(|| ClinicError::NotFound("User not registered".to_string()))?;

        if self.store.mark_checked_in(patient.id).await? {
            info!("Patient {} checked in", patient.id);
            Ok(CheckInOutcome::CheckedIn)
        } else {
            Ok(CheckInOutcome::AlreadyCheckedIn)
        }
    }

    pub async fn list_patients(&self) -> Result<Vec<Patient>> {
        self.store.list_patients().await
    }

    /// 注册医生
    pub async fn register_doctor(&self, registration: DoctorRegistration) -> Result<Doctor> {
        let specialties: Vec<String> = registration
            .specialties
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if specialties.is_empty() {
            return Err(ClinicError::InvalidArgument("At least one specialty is required".to_string()));
        }
        if registration.experience < 0 {
            return Err(ClinicError::InvalidArgument("Experience cannot be negative".to_string()));
        }
        if !registration.opd_rate.is_finite() || registration.opd_rate < 0.0 {
            return Err(ClinicError::InvalidArgument("OPD rate must be a non-negative number".to_string()));
        }

        let phone = match registration.phone.as_deref() {
            Some(phone) => Some(validate_phone(phone)?),
            None => None,
        };

        let doctor = NewDoctor {
            ssn: validate_ssn(&registration.ssn)?,
            name: validate_name(&registration.name)?,
            specialties,
            experience: registration.experience,
            opd_rate: registration.opd_rate,
            phone,
            profile_picture: registration.profile_picture,
        };

        let created = self.store.insert_doctor(doctor).await?;
        info!("Registered doctor {} ({})", created.id, created.name);
        Ok(created)
    }

    pub async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        self.store.list_doctors().await
    }

    /// 切换医生出诊状态
    pub async fn set_availability(&self, doctor_id: i64, is_available: bool) -> Result<Doctor> {
        let doctor = self.store.set_doctor_availability(doctor_id, is_available).await?;
        info!("Doctor {} availability set to {}", doctor_id, is_available);
        Ok(doctor)
    }

    /// 删除医生；仍有候诊患者或已预约号源时拒绝
    pub async fn delete_doctor(&self, doctor_id: i64) -> Result<()> {
        self.store.delete_doctor(doctor_id).await
    }
}
