//! 候诊队列管理
//!
//! 每个医生一个先进先出队列。等待中的位置始终是连续的 1..N：加入时追加到
//! 队尾，叫号时移除队首并把其余条目整体前移一位。每次叫号 O(N)，单个医生的
//! 队列很短，叫号频率也远低于加入频率。
//!
//! 加入和叫号都在存储提供的队列事务（队列行锁）内完成读-改-写，同一医生的
//! 操作因此线性化，不同医生之间互不阻塞。

use std::sync::Arc;

use chrono::Utc;
use clinic_core::utils::format_minutes;
use clinic_core::{CallerIdentity, ClinicError, ClinicStore, Queue, QueueEntry, QueueEntryStatus, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 每位患者的固定就诊时长（分钟）
pub const MINUTES_PER_PATIENT: i64 = 15;

/// 排在 `patients` 位置时的预计等待时间
pub fn estimated_wait(patients: i32) -> String {
    format_minutes(i64::from(patients.max(0)) * MINUTES_PER_PATIENT)
}

/// 加入队列的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinTicket {
    pub position: i32,
    pub estimated_wait: String,
}

/// 队列中的一位患者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePosition {
    pub position: i32,
    pub patient_id: i64,
    pub status: QueueEntryStatus,
}

/// 队列状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total_patients: i32,
    pub estimated_wait_time: String,
    pub current_queue: Vec<QueuePosition>,
}

impl QueueStatus {
    /// 尚无人排队的医生
    pub fn empty() -> Self {
        Self {
            total_patients: 0,
            estimated_wait_time: estimated_wait(0),
            current_queue: Vec::new(),
        }
    }
}

impl From<&Queue> for QueueStatus {
    fn from(queue: &Queue) -> Self {
        Self {
            total_patients: queue.total_patients,
            estimated_wait_time: queue.estimated_wait_time.clone(),
            current_queue: queue
                .entries
                .iter()
                .filter(|e| e.status == QueueEntryStatus::Waiting)
                .map(|e| QueuePosition {
                    position: e.position,
                    patient_id: e.patient_id,
                    status: e.status,
                })
                .collect(),
        }
    }
}

/// 叫号结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceOutcome {
    pub patient_id: i64,
    pub remaining_patients: i32,
}

/// 在队尾追加一位患者
pub fn enqueue(queue: &mut Queue, patient_id: i64) -> Result<JoinTicket> {
    if queue.contains_patient(patient_id) {
        return Err(ClinicError::Conflict("Patient already in queue".to_string()));
    }

    let position = queue.total_patients + 1;
    queue.entries.push(QueueEntry {
        id: Uuid::new_v4(),
        queue_id: queue.id,
        patient_id,
        position,
        status: QueueEntryStatus::Waiting,
        joined_at: Utc::now(),
    });
    queue.total_patients = position;
    queue.estimated_wait_time = estimated_wait(position);

    Ok(JoinTicket {
        position,
        estimated_wait: queue.estimated_wait_time.clone(),
    })
}

/// 移除队首并重新编号，返回被移除的条目
pub fn dequeue_head(queue: &mut Queue) -> Result<QueueEntry> {
    let head_index = queue
        .entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.status == QueueEntryStatus::Waiting)
        .min_by_key(|(_, e)| e.position)
        .map(|(index, _)| index)
        .ok_or_else(|| ClinicError::NotFound("No patients in queue".to_string()))?;

    let head = queue.entries.remove(head_index);

    for entry in queue.entries.iter_mut().filter(|e| e.status == QueueEntryStatus::Waiting) {
        entry.position -= 1;
    }
    queue.entries.sort_by_key(|e| e.position);

    queue.total_patients = (queue.total_patients - 1).max(0);
    queue.estimated_wait_time = estimated_wait(queue.total_patients);

    Ok(head)
}

/// 队列管理器
pub struct QueueManager {
    store: Arc<dyn ClinicStore>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn ClinicStore>) -> Self {
        Self { store }
    }

    /// 患者加入医生的候诊队列
    pub async fn join(&self, doctor_id: i64, patient_id: i64, caller: &CallerIdentity) -> Result<JoinTicket> {
        caller.ensure_acts_for(patient_id, "Unauthorized to join the queue for another patient")?;

        if self.store.find_doctor(doctor_id).await?.is_none() {
            return Err(ClinicError::NotFound("Doctor not found".to_string()));
        }
        if self.store.find_patient(patient_id).await?.is_none() {
            return Err(ClinicError::NotFound("Patient not found".to_string()));
        }

        let mut txn = self
            .store
            .lock_queue(doctor_id, true)
            .await?
            .ok_or_else(|| ClinicError::Internal(format!("Queue for doctor {} was not created", doctor_id)))?;

        let ticket = match enqueue(txn.queue_mut(), patient_id) {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!("Patient {} rejected from queue of doctor {}: {}", patient_id, doctor_id, e);
                return Err(e);
            }
        };
        txn.commit().await?;

        info!(
            "Patient {} joined queue of doctor {} at position {}",
            patient_id, doctor_id, ticket.position
        );
        Ok(ticket)
    }

    /// 查看队列状态；医生还没有队列时返回空状态
    pub async fn status(&self, doctor_id: i64) -> Result<QueueStatus> {
        let status = match self.store.queue_snapshot(doctor_id).await? {
            Some(queue) => QueueStatus::from(&queue),
            None => QueueStatus::empty(),
        };

        debug!("Queue status for doctor {}: {} waiting", doctor_id, status.total_patients);
        Ok(status)
    }

    /// 叫下一位患者
    pub async fn advance(&self, doctor_id: i64) -> Result<AdvanceOutcome> {
        let mut txn = self
            .store
            .lock_queue(doctor_id, false)
            .await?
            .ok_or_else(|| ClinicError::NotFound("Queue not found for this doctor".to_string()))?;

        let head = dequeue_head(txn.queue_mut())?;
        let remaining_patients = txn.queue().total_patients;
        txn.commit().await?;

        info!(
            "Doctor {} called patient {}; {} remaining",
            doctor_id, head.patient_id, remaining_patients
        );
        Ok(AdvanceOutcome {
            patient_id: head.patient_id,
            remaining_patients,
        })
    }
}
