//! 数据库模型

use chrono::{DateTime, NaiveDateTime, Utc};
use clinic_core::utils::parse_specialties;
use clinic_core::{Doctor, Patient, QueueEntry, QueueEntryStatus, Result, Slot, SlotType};
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub id: i64,
    pub ssn: String,
    pub name: String,
    pub phone: String,
    pub checkin_status: bool,
}

impl From<DbPatient> for Patient {
    fn from(db_patient: DbPatient) -> Self {
        Patient {
            id: db_patient.id,
            ssn: db_patient.ssn,
            name: db_patient.name,
            phone: db_patient.phone,
            checkin_status: db_patient.checkin_status,
        }
    }
}

/// 数据库医生表
#[derive(Debug, FromRow)]
pub struct DbDoctor {
    pub id: i64,
    pub ssn: String,
    pub name: String,
    pub specialties: String, // 逗号分隔
    pub experience: i32,
    pub opd_rate: f64,
    pub is_available: bool,
    pub phone: Option<String>,
    pub profile_picture: Option<String>,
}

impl From<DbDoctor> for Doctor {
    fn from(db_doctor: DbDoctor) -> Self {
        Doctor {
            id: db_doctor.id,
            ssn: db_doctor.ssn,
            name: db_doctor.name,
            specialties: parse_specialties(&db_doctor.specialties),
            experience: db_doctor.experience,
            opd_rate: db_doctor.opd_rate,
            is_available: db_doctor.is_available,
            phone: db_doctor.phone,
            profile_picture: db_doctor.profile_picture,
        }
    }
}

/// 数据库队列表
#[derive(Debug, FromRow)]
pub struct DbQueue {
    pub id: Uuid,
    pub doctor_id: i64,
    pub total_patients: i32,
    pub estimated_wait_time: String,
}

/// 数据库排队条目表
#[derive(Debug, FromRow)]
pub struct DbQueueEntry {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub patient_id: i64,
    pub position: i32,
    pub status: String, // 存储为字符串，转换为QueueEntryStatus枚举
    pub joined_at: DateTime<Utc>,
}

impl TryFrom<DbQueueEntry> for QueueEntry {
    type Error = clinic_core::ClinicError;

    fn try_from(db_entry: DbQueueEntry) -> Result<Self> {
        Ok(QueueEntry {
            id: db_entry.id,
            queue_id: db_entry.queue_id,
            patient_id: db_entry.patient_id,
            position: db_entry.position,
            status: QueueEntryStatus::parse(&db_entry.status)?,
            joined_at: db_entry.joined_at,
        })
    }
}

/// 数据库号源表
#[derive(Debug, FromRow)]
pub struct DbSlot {
    pub id: i64,
    pub doctor_id: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub is_available: bool,
    pub patient_id: Option<i64>,
    pub slot_type: String,
}

impl TryFrom<DbSlot> for Slot {
    type Error = clinic_core::ClinicError;

    fn try_from(db_slot: DbSlot) -> Result<Self> {
        Ok(Slot {
            id: db_slot.id,
            doctor_id: db_slot.doctor_id,
            start_time: db_slot.start_time,
            end_time: db_slot.end_time,
            is_available: db_slot.is_available,
            patient_id: db_slot.patient_id,
            slot_type: SlotType::parse(&db_slot.slot_type)?,
        })
    }
}

pub(crate) fn into_slots(rows: Vec<DbSlot>) -> Result<Vec<Slot>> {
    rows.into_iter().map(Slot::try_from).collect()
}
