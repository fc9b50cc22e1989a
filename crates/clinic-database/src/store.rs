//! PostgreSQL实体存储
//!
//! 队列操作在 `SELECT ... FOR UPDATE` 持有的队列行锁内完成；号源预约使用
//! 条件更新。所有锁等待都受 `lock_timeout` 限制。

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use clinic_core::utils::format_minutes;
use clinic_core::{
    ClinicError, ClinicStore, Doctor, NewDoctor, NewPatient, NewSlot, Patient, Queue, QueueEntry, QueueTxn,
    Result, Slot,
};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::connection::DatabasePool;
use crate::models::{DbQueue, DbQueueEntry, DbSlot};
use crate::queries::DatabaseQueries;

/// 基于PostgreSQL的存储
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DatabasePool,
    lock_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: DatabasePool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    fn queries(&self) -> DatabaseQueries<'_> {
        DatabaseQueries::new(&self.pool)
    }

    /// 开启事务并设置锁等待上限
    async fn begin_bounded(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.pool().begin().await?;

        // SET 不支持参数绑定；毫秒数是整数，直接拼接
        let statement = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&statement).execute(&mut *tx).await?;

        Ok(tx)
    }

    /// 在事务内读取队列及其等待条目；`for_update` 时锁住队列行
    async fn load_queue(
        tx: &mut Transaction<'static, Postgres>,
        doctor_id: i64,
        for_update: bool,
    ) -> Result<Option<Queue>> {
        let sql = if for_update {
            "SELECT id, doctor_id, total_patients, estimated_wait_time FROM queues WHERE doctor_id = $1 FOR UPDATE"
        } else {
            "SELECT id, doctor_id, total_patients, estimated_wait_time FROM queues WHERE doctor_id = $1"
        };
        let row = sqlx::query_as::<_, DbQueue>(sql)
        .bind(doctor_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let entries = sqlx::query_as::<_, DbQueueEntry>(
            "SELECT * FROM queue_entries WHERE queue_id = $1 AND status = 'waiting' ORDER BY position",
        )
        .bind(row.id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(QueueEntry::try_from)
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(Queue {
            id: row.id,
            doctor_id: row.doctor_id,
            total_patients: row.total_patients,
            estimated_wait_time: row.estimated_wait_time,
            entries,
        }))
    }

    /// 条件更新没有命中时，区分号源不存在和状态不符
    async fn slot_miss(tx: &mut Transaction<'static, Postgres>, slot_id: i64, conflict: &str) -> ClinicError {
        let exists = sqlx::query_scalar::<_, i64>("SELECT id FROM slots WHERE id = $1")
            .bind(slot_id)
            .fetch_optional(&mut **tx)
            .await;

        match exists {
            Ok(Some(_)) => ClinicError::Conflict(conflict.to_string()),
            Ok(None) => ClinicError::NotFound("Slot not found".to_string()),
            Err(e) => ClinicError::from(e),
        }
    }
}

/// 队列事务提交时要执行的写操作
///
/// 位置只会前移，所以移动的条目按新位置升序更新：每次写入的目标位置都已被
/// 删除或前移腾空，不会触发等待条目位置的部分唯一索引。
#[derive(Debug, Default, PartialEq)]
pub(crate) struct CommitPlan {
    pub deletes: Vec<Uuid>,
    pub updates: Vec<(Uuid, i32)>,
    pub inserts: Vec<QueueEntry>,
}

impl CommitPlan {
    pub fn between(original: &Queue, working: &Queue) -> Self {
        let working_ids: HashSet<Uuid> = working.entries.iter().map(|e| e.id).collect();
        let original_positions: HashMap<Uuid, i32> =
            original.entries.iter().map(|e| (e.id, e.position)).collect();

        let deletes = original
            .entries
            .iter()
            .filter(|e| !working_ids.contains(&e.id))
            .map(|e| e.id)
            .collect();

        let mut updates: Vec<(Uuid, i32)> = working
            .entries
            .iter()
            .filter(|e| original_positions.get(&e.id).is_some_and(|p| *p != e.position))
            .map(|e| (e.id, e.position))
            .collect();
        updates.sort_by_key(|(_, position)| *position);

        let mut inserts: Vec<QueueEntry> = working
            .entries
            .iter()
            .filter(|e| !original_positions.contains_key(&e.id))
            .cloned()
            .collect();
        inserts.sort_by_key(|e| e.position);

        Self { deletes, updates, inserts }
    }
}

/// PostgreSQL上的队列事务
pub struct PgQueueTxn {
    tx: Option<Transaction<'static, Postgres>>,
    original: Queue,
    working: Queue,
}

#[async_trait]
impl QueueTxn for PgQueueTxn {
    fn queue(&self) -> &Queue {
        &self.working
    }

    fn queue_mut(&mut self) -> &mut Queue {
        &mut self.working
    }

    async fn commit(&mut self) -> Result<()> {
        let mut tx = self
            .tx
            .take()
            .ok_or_else(|| ClinicError::Internal("Queue transaction already finished".to_string()))?;

        let plan = CommitPlan::between(&self.original, &self.working);

        if !plan.deletes.is_empty() {
            sqlx::query("DELETE FROM queue_entries WHERE id = ANY($1)")
                .bind(&plan.deletes)
                .execute(&mut *tx)
                .await?;
        }

        for (id, position) in &plan.updates {
            sqlx::query("UPDATE queue_entries SET position = $1 WHERE id = $2")
                .bind(position)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        for entry in &plan.inserts {
            sqlx::query(r#"
                INSERT INTO queue_entries (id, queue_id, patient_id, position, status, joined_at)
                VALUES ($1, $2, $3, $4, $5, $6)
            "#)
            .bind(entry.id)
            .bind(entry.queue_id)
            .bind(entry.patient_id)
            .bind(entry.position)
            .bind(entry.status.as_str())
            .bind(entry.joined_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE queues SET total_patients = $1, estimated_wait_time = $2 WHERE id = $3")
            .bind(self.working.total_patients)
            .bind(&self.working.estimated_wait_time)
            .bind(self.working.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ClinicStore for PgStore {
    async fn insert_patient(&self, patient: NewPatient) -> Result<Patient> {
        self.queries().create_patient(&patient).await
    }

    async fn find_patient(&self, id: i64) -> Result<Option<Patient>> {
        self.queries().get_patient_by_id(id).await
    }

    async fn find_patient_by_ssn(&self, ssn: &str) -> Result<Option<Patient>> {
        self.queries().get_patient_by_ssn(ssn).await
    }

    async fn list_patients(&self) -> Result<Vec<Patient>> {
        self.queries().list_patients().await
    }

    async fn mark_checked_in(&self, patient_id: i64) -> Result<bool> {
        self.queries().mark_checked_in(patient_id).await
    }

    async fn insert_doctor(&self, doctor: NewDoctor) -> Result<Doctor> {
        self.queries().create_doctor(&doctor).await
    }

    async fn find_doctor(&self, id: i64) -> Result<Option<Doctor>> {
        self.queries().get_doctor_by_id(id).await
    }

    async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        self.queries().list_doctors().await
    }

    async fn set_doctor_availability(&self, id: i64, is_available: bool) -> Result<Doctor> {
        self.queries()
            .update_doctor_availability(id, is_available)
            .await?
            .ok_or_else(|| ClinicError::NotFound("Doctor not found".to_string()))
    }

    async fn delete_doctor(&self, id: i64) -> Result<()> {
        let mut tx = self.begin_bounded().await?;

        let doctor = sqlx::query_scalar::<_, i64>("SELECT id FROM doctors WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if doctor.is_none() {
            return Err(ClinicError::NotFound("Doctor not found".to_string()));
        }

        if let Some(queue) = Self::load_queue(&mut tx, id, true).await? {
            if queue.total_patients > 0 {
                return Err(ClinicError::Conflict("Doctor has patients waiting in queue".to_string()));
            }
        }

        // 锁住该医生全部号源，防止检查之后有新的预约
        let booked = sqlx::query_scalar::<_, bool>("SELECT is_available FROM slots WHERE doctor_id = $1 FOR UPDATE")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .any(|is_available| !is_available);
        if booked {
            return Err(ClinicError::Conflict("Doctor has booked slots".to_string()));
        }

        sqlx::query("DELETE FROM queues WHERE doctor_id = $1").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM slots WHERE doctor_id = $1").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM doctors WHERE id = $1").bind(id).execute(&mut *tx).await?;

        tx.commit().await?;
        tracing::info!("Deleted doctor {}", id);
        Ok(())
    }

    async fn queue_snapshot(&self, doctor_id: i64) -> Result<Option<Queue>> {
        // 队列行和条目必须来自同一个快照，否则计数和列表可能不一致
        let mut tx = self.pool.pool().begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let queue = Self::load_queue(&mut tx, doctor_id, false).await?;
        tx.commit().await?;
        Ok(queue)
    }

    async fn lock_queue(&self, doctor_id: i64, create_if_missing: bool) -> Result<Option<Box<dyn QueueTxn>>> {
        let mut tx = self.begin_bounded().await?;

        if create_if_missing {
            // 并发首次加入时由 doctor_id 唯一约束裁决，落败方等待后什么也不做
            sqlx::query(r#"
                INSERT INTO queues (id, doctor_id, total_patients, estimated_wait_time)
                VALUES ($1, $2, 0, $3)
                ON CONFLICT (doctor_id) DO NOTHING
            "#)
            .bind(Uuid::new_v4())
            .bind(doctor_id)
            .bind(format_minutes(0))
            .execute(&mut *tx)
            .await?;
        }

        let Some(queue) = Self::load_queue(&mut tx, doctor_id, true).await? else {
            return Ok(None);
        };

        tracing::debug!("Locked queue {} for doctor {}", queue.id, doctor_id);
        Ok(Some(Box::new(PgQueueTxn {
            tx: Some(tx),
            original: queue.clone(),
            working: queue,
        })))
    }

    async fn insert_slot(&self, slot: NewSlot) -> Result<Slot> {
        self.queries().create_slot(&slot).await
    }

    async fn find_slot(&self, id: i64) -> Result<Option<Slot>> {
        self.queries().get_slot_by_id(id).await
    }

    async fn list_available_slots(&self, doctor_id: i64, from: NaiveDateTime, to: NaiveDateTime) -> Result<Vec<Slot>> {
        self.queries().get_available_slots(doctor_id, from, to).await
    }

    async fn list_slots(&self) -> Result<Vec<Slot>> {
        self.queries().list_slots().await
    }

    async fn book_slot(&self, slot_id: i64, patient_id: i64) -> Result<Slot> {
        let mut tx = self.begin_bounded().await?;

        let booked = sqlx::query_as::<_, DbSlot>(r#"
            UPDATE slots SET is_available = FALSE, patient_id = $2
            WHERE id = $1 AND is_available
            RETURNING id, doctor_id, start_time, end_time, is_available, patient_id, slot_type
        "#)
        .bind(slot_id)
        .bind(patient_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = booked else {
            return Err(Self::slot_miss(&mut tx, slot_id, "Slot is no longer available").await);
        };

        tx.commit().await?;
        Slot::try_from(row)
    }

    async fn release_slot(&self, slot_id: i64, patient_id: i64) -> Result<Slot> {
        let mut tx = self.begin_bounded().await?;

        let released = sqlx::query_as::<_, DbSlot>(r#"
            UPDATE slots SET is_available = TRUE, patient_id = NULL
            WHERE id = $1 AND patient_id = $2
            RETURNING id, doctor_id, start_time, end_time, is_available, patient_id, slot_type
        "#)
        .bind(slot_id)
        .bind(patient_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = released else {
            return Err(Self::slot_miss(&mut tx, slot_id, "Slot is not booked by this patient").await);
        };

        tx.commit().await?;
        Slot::try_from(row)
    }

    async fn delete_slot(&self, slot_id: i64) -> Result<()> {
        let mut tx = self.begin_bounded().await?;

        let deleted = sqlx::query_scalar::<_, i64>("DELETE FROM slots WHERE id = $1 AND is_available RETURNING id")
            .bind(slot_id)
            .fetch_optional(&mut *tx)
            .await?;

        if deleted.is_none() {
            return Err(Self::slot_miss(&mut tx, slot_id, "Cannot delete a booked slot").await);
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clinic_core::QueueEntryStatus;
    use std::sync::Arc;

    fn entry(queue: &Queue, patient_id: i64, position: i32) -> QueueEntry {
        QueueEntry {
            id: Uuid::new_v4(),
            queue_id: queue.id,
            patient_id,
            position,
            status: QueueEntryStatus::Waiting,
            joined_at: Utc::now(),
        }
    }

    fn queue_of(patients: &[i64]) -> Queue {
        let mut queue = Queue::new(1);
        for (index, patient_id) in patients.iter().enumerate() {
            let e = entry(&queue, *patient_id, index as i32 + 1);
            queue.entries.push(e);
        }
        queue.total_patients = patients.len() as i32;
        queue
    }

    /// 移除队首并前移其余条目
    fn pop_head(queue: &mut Queue) -> QueueEntry {
        let head = queue.entries.remove(0);
        for e in queue.entries.iter_mut() {
            e.position -= 1;
        }
        queue.total_patients -= 1;
        head
    }

    #[test]
    fn test_plan_for_join_only_inserts() {
        let original = queue_of(&[10, 11]);
        let mut working = original.clone();
        let joined = entry(&working, 12, 3);
        working.entries.push(joined.clone());
        working.total_patients = 3;

        let plan = CommitPlan::between(&original, &working);
        assert!(plan.deletes.is_empty());
        assert!(plan.updates.is_empty());
        assert_eq!(plan.inserts, vec![joined]);
    }

    #[test]
    fn test_plan_for_advance_deletes_head_and_renumbers() {
        let original = queue_of(&[10, 11, 12]);
        let mut working = original.clone();
        let head = pop_head(&mut working);

        let plan = CommitPlan::between(&original, &working);
        assert_eq!(plan.deletes, vec![head.id]);
        assert_eq!(
            plan.updates,
            vec![(original.entries[1].id, 1), (original.entries[2].id, 2)]
        );
        assert!(plan.inserts.is_empty());
    }

    #[test]
    fn test_plan_updates_ascend_by_new_position() {
        let original = queue_of(&[10, 11, 12, 13, 14]);
        let mut working = original.clone();
        pop_head(&mut working);
        working.entries.reverse();

        let plan = CommitPlan::between(&original, &working);
        let positions: Vec<i32> = plan.updates.iter().map(|(_, p)| *p).collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);

        // 依次应用更新，任何时刻都不会有两个条目占用同一位置
        let mut occupied: HashMap<Uuid, i32> = original
            .entries
            .iter()
            .filter(|e| !plan.deletes.contains(&e.id))
            .map(|e| (e.id, e.position))
            .collect();
        for (id, position) in &plan.updates {
            assert!(occupied.iter().all(|(other, p)| other == id || p != position));
            occupied.insert(*id, *position);
        }
    }

    #[test]
    fn test_unchanged_queue_has_empty_plan() {
        let original = queue_of(&[10, 11]);
        assert_eq!(CommitPlan::between(&original, &original.clone()), CommitPlan::default());
    }

    /// 需要 `CLINIC_TEST_DATABASE_URL` 指向可写的PostgreSQL，否则跳过
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_snapshot_is_consistent_under_concurrent_advances() {
        let Ok(url) = std::env::var("CLINIC_TEST_DATABASE_URL") else {
            return;
        };
        let pool = DatabasePool::connect(&url, 8, Duration::from_secs(10)).await.unwrap();
        crate::queries::DatabaseQueries::new(&pool).create_tables().await.unwrap();
        let store = Arc::new(PgStore::new(pool, Duration::from_secs(5)));

        let tag = Uuid::new_v4().simple().to_string();
        let doctor = store
            .insert_doctor(NewDoctor {
                ssn: format!("d{}", &tag[..10]),
                name: "Dr. Snapshot".to_string(),
                specialties: vec!["General".to_string()],
                experience: 1,
                opd_rate: 1.0,
                phone: None,
                profile_picture: None,
            })
            .await
            .unwrap();

        let mut txn = store.lock_queue(doctor.id, true).await.unwrap().unwrap();
        for i in 0..20 {
            let patient = store
                .insert_patient(NewPatient {
                    ssn: format!("p{}{:02}", &tag[..9], i),
                    name: "Patient".to_string(),
                    phone: "5551234567".to_string(),
                })
                .await
                .unwrap();
            let queue = txn.queue_mut();
            let e = entry(queue, patient.id, queue.total_patients + 1);
            queue.entries.push(e);
            queue.total_patients += 1;
        }
        txn.commit().await.unwrap();
        drop(txn);

        let advancer = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    let mut txn = store.lock_queue(doctor.id, false).await.unwrap().unwrap();
                    pop_head(txn.queue_mut());
                    txn.commit().await.unwrap();
                }
            })
        };

        while !advancer.is_finished() {
            let queue = store.queue_snapshot(doctor.id).await.unwrap().unwrap();
            assert_eq!(queue.entries.len(), queue.total_patients as usize);
            assert!(queue.is_dense());
        }
        advancer.await.unwrap();

        let queue = store.queue_snapshot(doctor.id).await.unwrap().unwrap();
        assert_eq!(queue.total_patients, 0);
        store.delete_doctor(doctor.id).await.unwrap();
    }
}
