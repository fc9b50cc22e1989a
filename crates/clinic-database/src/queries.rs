//! 数据库查询操作

use crate::connection::DatabasePool;
use crate::models::*;
use clinic_core::utils::join_specialties;
use clinic_core::{ClinicError, Doctor, NewDoctor, NewPatient, NewSlot, Patient, Result, Slot};
use chrono::NaiveDateTime;

/// 唯一约束冲突转换为带业务消息的 Conflict
pub(crate) fn map_unique_violation(err: sqlx::Error, message: &str) -> ClinicError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return ClinicError::Conflict(message.to_string());
        }
    }
    ClinicError::from(err)
}

/// 数据库查询操作接口
pub struct DatabaseQueries<'a> {
    pool: &'a DatabasePool,
}

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 患者表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGSERIAL PRIMARY KEY,
                ssn VARCHAR(12) UNIQUE NOT NULL,
                name VARCHAR(100) NOT NULL,
                phone VARCHAR(15) NOT NULL,
                checkin_status BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#).execute(pool).await?;

        // 医生表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS doctors (
                id BIGSERIAL PRIMARY KEY,
                ssn VARCHAR(12) UNIQUE NOT NULL,
                name VARCHAR(100) NOT NULL,
                specialties VARCHAR(255) NOT NULL,
                experience INTEGER NOT NULL CHECK (experience >= 0),
                opd_rate DOUBLE PRECISION NOT NULL CHECK (opd_rate >= 0),
                is_available BOOLEAN NOT NULL DEFAULT TRUE,
                phone VARCHAR(100),
                profile_picture VARCHAR(255)
            )
        "#).execute(pool).await?;

        // 队列表，每个医生至多一个
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS queues (
                id UUID PRIMARY KEY,
                doctor_id BIGINT UNIQUE NOT NULL REFERENCES doctors(id),
                total_patients INTEGER NOT NULL DEFAULT 0 CHECK (total_patients >= 0),
                estimated_wait_time VARCHAR(50) NOT NULL DEFAULT '0 minutes'
            )
        "#).execute(pool).await?;

        // 排队条目表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS queue_entries (
                id UUID PRIMARY KEY,
                queue_id UUID NOT NULL REFERENCES queues(id) ON DELETE CASCADE,
                patient_id BIGINT NOT NULL REFERENCES users(id),
                position INTEGER NOT NULL CHECK (position > 0),
                status VARCHAR(20) NOT NULL DEFAULT 'waiting',
                joined_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await?;

        // 号源表：可用 <=> 未关联患者
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS slots (
                id BIGSERIAL PRIMARY KEY,
                doctor_id BIGINT NOT NULL REFERENCES doctors(id),
                start_time TIMESTAMP NOT NULL,
                end_time TIMESTAMP NOT NULL,
                is_available BOOLEAN NOT NULL DEFAULT TRUE,
                patient_id BIGINT REFERENCES users(id),
                slot_type VARCHAR(20) NOT NULL DEFAULT 'appointment',
                CHECK (end_time > start_time),
                CHECK (is_available = (patient_id IS NULL))
            )
        "#).execute(pool).await?;

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = vec![
            // 等待中的条目位置唯一、同一患者在同一队列只能等待一次
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_queue_entries_waiting_position ON queue_entries(queue_id, position) WHERE status = 'waiting'",
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_queue_entries_waiting_patient ON queue_entries(queue_id, patient_id) WHERE status = 'waiting'",
            "CREATE INDEX IF NOT EXISTS idx_queue_entries_patient_id ON queue_entries(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_slots_doctor_start ON slots(doctor_id, start_time)",
            "CREATE INDEX IF NOT EXISTS idx_slots_patient_id ON slots(patient_id)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }

    // ========== 患者相关操作 ==========

    /// 创建新患者
    pub async fn create_patient(&self, patient: &NewPatient) -> Result<Patient> {
        let pool = self.pool.pool();

        let row = sqlx::query_as::<_, DbPatient>(r#"
            INSERT INTO users (ssn, name, phone)
            VALUES ($1, $2, $3)
            RETURNING id, ssn, name, phone, checkin_status
        "#)
        .bind(&patient.ssn)
        .bind(&patient.name)
        .bind(&patient.phone)
        .fetch_one(pool)
        .await
        .map_err(|e| map_unique_violation(e, "User with this SSN already exists"))?;

        Ok(Patient::from(row))
    }

    /// 根据ID查找患者
    pub async fn get_patient_by_id(&self, id: i64) -> Result<Option<Patient>> {
        let result = sqlx::query_as::<_, DbPatient>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(result.map(Patient::from))
    }

    /// 根据SSN查找患者
    pub async fn get_patient_by_ssn(&self, ssn: &str) -> Result<Option<Patient>> {
        let result = sqlx::query_as::<_, DbPatient>("SELECT * FROM users WHERE ssn = $1")
            .bind(ssn)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(result.map(Patient::from))
    }

    /// 全部患者
    pub async fn list_patients(&self) -> Result<Vec<Patient>> {
        let results = sqlx::query_as::<_, DbPatient>("SELECT * FROM users ORDER BY id")
            .fetch_all(self.pool.pool())
            .await?;

        Ok(results.into_iter().map(Patient::from).collect())
    }

    /// 标记签到，仅在尚未签到时更新
    pub async fn mark_checked_in(&self, patient_id: i64) -> Result<bool> {
        let updated = sqlx::query("UPDATE users SET checkin_status = TRUE WHERE id = $1 AND NOT checkin_status")
            .bind(patient_id)
            .execute(self.pool.pool())
            .await?;

        Ok(updated.rows_affected() == 1)
    }

    // ========== 医生相关操作 ==========

    /// 创建新医生
    pub async fn create_doctor(&self, doctor: &NewDoctor) -> Result<Doctor> {
        let row = sqlx::query_as::<_, DbDoctor>(r#"
            INSERT INTO doctors (ssn, name, specialties, experience, opd_rate, phone, profile_picture)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
        "#)
        .bind(&doctor.ssn)
        .bind(&doctor.name)
        .bind(join_specialties(&doctor.specialties))
        .bind(doctor.experience)
        .bind(doctor.opd_rate)
        .bind(&doctor.phone)
        .bind(&doctor.profile_picture)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| map_unique_violation(e, "Doctor with this SSN already exists"))?;

        Ok(Doctor::from(row))
    }

    /// 根据ID查找医生
    pub async fn get_doctor_by_id(&self, id: i64) -> Result<Option<Doctor>> {
        let result = sqlx::query_as::<_, DbDoctor>("SELECT * FROM doctors WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(result.map(Doctor::from))
    }

    /// 全部医生
    pub async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        let results = sqlx::query_as::<_, DbDoctor>("SELECT * FROM doctors ORDER BY id")
            .fetch_all(self.pool.pool())
            .await?;

        Ok(results.into_iter().map(Doctor::from).collect())
    }

    /// 更新医生出诊状态
    pub async fn update_doctor_availability(&self, id: i64, is_available: bool) -> Result<Option<Doctor>> {
        let result = sqlx::query_as::<_, DbDoctor>("UPDATE doctors SET is_available = $2 WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(is_available)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(result.map(Doctor::from))
    }

    // ========== 号源相关操作 ==========

    /// 创建新号源
    pub async fn create_slot(&self, slot: &NewSlot) -> Result<Slot> {
        let row = sqlx::query_as::<_, DbSlot>(r#"
            INSERT INTO slots (doctor_id, start_time, end_time, slot_type)
            VALUES ($1, $2, $3, $4)
            RETURNING id, doctor_id, start_time, end_time, is_available, patient_id, slot_type
        "#)
        .bind(slot.doctor_id)
        .bind(slot.start_time)
        .bind(slot.end_time)
        .bind(slot.slot_type.as_str())
        .fetch_one(self.pool.pool())
        .await?;

        Slot::try_from(row)
    }

    /// 根据ID查找号源
    pub async fn get_slot_by_id(&self, id: i64) -> Result<Option<Slot>> {
        let result = sqlx::query_as::<_, DbSlot>("SELECT * FROM slots WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        result.map(Slot::try_from).transpose()
    }

    /// 医生在时间窗口内的可用号源
    pub async fn get_available_slots(
        &self,
        doctor_id: i64,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Slot>> {
        let results = sqlx::query_as::<_, DbSlot>(r#"
            SELECT * FROM slots
            WHERE doctor_id = $1 AND is_available AND start_time BETWEEN $2 AND $3
            ORDER BY start_time
        "#)
        .bind(doctor_id)
        .bind(from)
        .bind(to)
        .fetch_all(self.pool.pool())
        .await?;

        into_slots(results)
    }

    /// 全部号源
    pub async fn list_slots(&self) -> Result<Vec<Slot>> {
        let results = sqlx::query_as::<_, DbSlot>("SELECT * FROM slots ORDER BY start_time, id")
            .fetch_all(self.pool.pool())
            .await?;

        into_slots(results)
    }
}
