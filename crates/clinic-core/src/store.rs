//! 实体存储契约
//!
//! 排队管理和号源分配只通过这里的接口访问数据。所有顺序保证都由存储的
//! 事务和锁来实现，而不是进程内互斥，因此服务可以多进程部署。

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::error::Result;
use crate::models::{Doctor, NewDoctor, NewPatient, NewSlot, Patient, Queue, Slot};

/// 单个医生队列上的事务
///
/// 持有队列行锁期间提供可修改的工作副本；`commit` 原子地持久化全部修改，
/// 未提交就被丢弃时回滚，不留下任何部分效果。
#[async_trait]
pub trait QueueTxn: Send {
    fn queue(&self) -> &Queue;

    fn queue_mut(&mut self) -> &mut Queue;

    /// 提交工作副本。只能调用一次。
    async fn commit(&mut self) -> Result<()>;
}

/// 诊所实体存储
#[async_trait]
pub trait ClinicStore: Send + Sync {
    // ========== 患者 ==========

    /// 插入患者；SSN重复时返回 Conflict
    async fn insert_patient(&self, patient: NewPatient) -> Result<Patient>;

    async fn find_patient(&self, id: i64) -> Result<Option<Patient>>;

    async fn find_patient_by_ssn(&self, ssn: &str) -> Result<Option<Patient>>;

    async fn list_patients(&self) -> Result<Vec<Patient>>;

    /// 标记签到；返回本次是否发生了状态变化
    async fn mark_checked_in(&self, patient_id: i64) -> Result<bool>;

    // ========== 医生 ==========

    /// 插入医生；SSN重复时返回 Conflict
    async fn insert_doctor(&self, doctor: NewDoctor) -> Result<Doctor>;

    async fn find_doctor(&self, id: i64) -> Result<Option<Doctor>>;

    async fn list_doctors(&self) -> Result<Vec<Doctor>>;

    async fn set_doctor_availability(&self, id: i64, is_available: bool) -> Result<Doctor>;

    /// 删除医生及其空队列和未预约号源；有候诊患者或已预约号源时返回 Conflict
    async fn delete_doctor(&self, id: i64) -> Result<()>;

    // ========== 队列 ==========

    /// 只读快照，不加锁
    async fn queue_snapshot(&self, doctor_id: i64) -> Result<Option<Queue>>;

    /// 锁定医生的队列；`create_if_missing` 为真时按需创建（每个医生至多一个队列）。
    /// 队列不存在且不创建时返回 `None`。锁等待超时返回 Timeout。
    async fn lock_queue(&self, doctor_id: i64, create_if_missing: bool) -> Result<Option<Box<dyn QueueTxn>>>;

    // ========== 号源 ==========

    async fn insert_slot(&self, slot: NewSlot) -> Result<Slot>;

    async fn find_slot(&self, id: i64) -> Result<Option<Slot>>;

    /// 可用号源，start_time 落在 [from, to] 内，按 start_time 升序
    async fn list_available_slots(&self, doctor_id: i64, from: NaiveDateTime, to: NaiveDateTime) -> Result<Vec<Slot>>;

    async fn list_slots(&self) -> Result<Vec<Slot>>;

    /// 比较并设置：仅当号源仍可用时预约。不存在返回 NotFound，已被占用返回 Conflict。
    async fn book_slot(&self, slot_id: i64, patient_id: i64) -> Result<Slot>;

    /// 比较并设置：仅当号源由该患者预约时释放
    async fn release_slot(&self, slot_id: i64, patient_id: i64) -> Result<Slot>;

    /// 删除未预约的号源；已预约返回 Conflict
    async fn delete_slot(&self, slot_id: i64) -> Result<()>;
}
