//! 核心数据模型定义

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClinicError, Result};

/// 患者基本信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub ssn: String,
    pub name: String,
    pub phone: String,          // 已规范化的10位号码
    pub checkin_status: bool,
}

/// 新患者插入模型
#[derive(Debug, Clone)]
pub struct NewPatient {
    pub ssn: String,
    pub name: String,
    pub phone: String,
}

/// 医生信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: i64,
    pub ssn: String,
    pub name: String,
    pub specialties: Vec<String>,
    pub experience: i32,        // 从业年限
    pub opd_rate: f64,          // 门诊费用
    pub is_available: bool,
    pub phone: Option<String>,
    pub profile_picture: Option<String>,
}

/// 新医生插入模型
#[derive(Debug, Clone)]
pub struct NewDoctor {
    pub ssn: String,
    pub name: String,
    pub specialties: Vec<String>,
    pub experience: i32,
    pub opd_rate: f64,
    pub phone: Option<String>,
    pub profile_picture: Option<String>,
}

/// 排队条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    Waiting,
    InConsultation,
}

impl QueueEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEntryStatus::Waiting => "waiting",
            QueueEntryStatus::InConsultation => "in_consultation",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "waiting" => Ok(QueueEntryStatus::Waiting),
            "in_consultation" => Ok(QueueEntryStatus::InConsultation),
            other => Err(ClinicError::Internal(format!("Unknown queue entry status: {}", other))),
        }
    }
}

/// 排队条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub patient_id: i64,
    pub position: i32,
    pub status: QueueEntryStatus,
    pub joined_at: DateTime<Utc>,
}

/// 医生的候诊队列，连同当前等待中的条目
///
/// `entries` 只包含状态为 waiting 的条目，并按 position 升序排列。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub id: Uuid,
    pub doctor_id: i64,
    pub total_patients: i32,
    pub estimated_wait_time: String,
    pub entries: Vec<QueueEntry>,
}

impl Queue {
    /// 创建空队列
    pub fn new(doctor_id: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            doctor_id,
            total_patients: 0,
            estimated_wait_time: crate::utils::format_minutes(0),
            entries: Vec::new(),
        }
    }

    /// 等待中的条目位置恰好是 1..=total_patients
    pub fn is_dense(&self) -> bool {
        if self.entries.len() != self.total_patients.max(0) as usize {
            return false;
        }
        self.entries
            .iter()
            .enumerate()
            .all(|(index, entry)| entry.position == index as i32 + 1 && entry.status == QueueEntryStatus::Waiting)
    }

    pub fn contains_patient(&self, patient_id: i64) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.patient_id == patient_id && entry.status == QueueEntryStatus::Waiting)
    }
}

/// 号源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    #[default]
    Appointment,
    WalkIn,
}

impl SlotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotType::Appointment => "appointment",
            SlotType::WalkIn => "walk_in",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "appointment" => Ok(SlotType::Appointment),
            "walk_in" => Ok(SlotType::WalkIn),
            other => Err(ClinicError::InvalidArgument(format!("Invalid slot type: {}", other))),
        }
    }
}

/// 预约号源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: i64,
    pub doctor_id: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub is_available: bool,
    pub patient_id: Option<i64>,
    pub slot_type: SlotType,
}

/// 新号源插入模型
#[derive(Debug, Clone)]
pub struct NewSlot {
    pub doctor_id: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub slot_type: SlotType,
}

/// 经访问网关验证后的调用者身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub patient_id: i64,
    pub ssn: String,
}

impl CallerIdentity {
    /// 只允许患者为自己操作
    pub fn ensure_acts_for(&self, patient_id: i64, message: &str) -> Result<()> {
        if self.patient_id == patient_id {
            Ok(())
        } else {
            Err(ClinicError::Forbidden(message.to_string()))
        }
    }
}
