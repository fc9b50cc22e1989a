//! 内存实体存储
//!
//! 与 [`PgStore`](crate::PgStore) 遵循相同的事务契约：每个医生队列一把异步互斥锁，
//! 号源和名册的条件更新在同一把表锁内完成。用于测试和本地运行。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use clinic_core::{
    ClinicError, ClinicStore, Doctor, NewDoctor, NewPatient, NewSlot, Patient, Queue, QueueTxn, Result, Slot,
};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

type QueueCell = Arc<Mutex<Option<Queue>>>;

#[derive(Debug, Default)]
struct Tables {
    patients: BTreeMap<i64, Patient>,
    doctors: BTreeMap<i64, Doctor>,
    slots: BTreeMap<i64, Slot>,
    next_patient_id: i64,
    next_doctor_id: i64,
    next_slot_id: i64,
}

impl Tables {
    fn next_id(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }
}

/// 内存存储
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    queues: Mutex<HashMap<i64, QueueCell>>,
    lock_timeout: Duration,
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            queues: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// 已存在的队列锁；只读和不创建队列的路径不能插入新条目
    async fn existing_cell(&self, doctor_id: i64) -> Option<QueueCell> {
        self.queues.lock().await.get(&doctor_id).cloned()
    }

    async fn cell_or_insert(&self, doctor_id: i64) -> QueueCell {
        let mut queues = self.queues.lock().await;
        queues.entry(doctor_id).or_default().clone()
    }

    async fn discard_cell(&self, doctor_id: i64) {
        self.queues.lock().await.remove(&doctor_id);
    }

    async fn lock_cell(&self, cell: QueueCell, doctor_id: i64) -> Result<OwnedMutexGuard<Option<Queue>>> {
        tokio::time::timeout(self.lock_timeout, cell.lock_owned())
            .await
            .map_err(|_| ClinicError::Timeout(format!("Timed out waiting for queue of doctor {}", doctor_id)))
    }

    async fn doctor_exists(&self, doctor_id: i64) -> bool {
        self.tables.read().await.doctors.contains_key(&doctor_id)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// 内存队列事务：持有队列锁，提交时整体替换
pub struct MemoryQueueTxn {
    guard: Option<OwnedMutexGuard<Option<Queue>>>,
    working: Queue,
}

#[async_trait]
impl QueueTxn for MemoryQueueTxn {
    fn queue(&self) -> &Queue {
        &self.working
    }

    fn queue_mut(&mut self) -> &mut Queue {
        &mut self.working
    }

    async fn commit(&mut self) -> Result<()> {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| ClinicError::Internal("Queue transaction already finished".to_string()))?;
        *guard = Some(self.working.clone());
        Ok(())
    }
}

#[async_trait]
impl ClinicStore for MemoryStore {
    async fn insert_patient(&self, patient: NewPatient) -> Result<Patient> {
        let mut tables = self.tables.write().await;

        if tables.patients.values().any(|p| p.ssn == patient.ssn) {
            return Err(ClinicError::Conflict("User with this SSN already exists".to_string()));
        }

        let id = Tables::next_id(&mut tables.next_patient_id);
        let created = Patient {
            id,
            ssn: patient.ssn,
            name: patient.name,
            phone: patient.phone,
            checkin_status: false,
        };
        tables.patients.insert(id, created.clone());
        Ok(created)
    }

    async fn find_patient(&self, id: i64) -> Result<Option<Patient>> {
        Ok(self.tables.read().await.patients.get(&id).cloned())
    }

    async fn find_patient_by_ssn(&self, ssn: &str) -> Result<Option<Patient>> {
        Ok(self.tables.read().await.patients.values().find(|p| p.ssn == ssn).cloned())
    }

    async fn list_patients(&self) -> Result<Vec<Patient>> {
        Ok(self.tables.read().await.patients.values().cloned().collect())
    }

    async fn mark_checked_in(&self, patient_id: i64) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.patients.get_mut(&patient_id) {
            Some(patient) if !patient.checkin_status => {
                patient.checkin_status = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_doctor(&self, doctor: NewDoctor) -> Result<Doctor> {
        let mut tables = self.tables.write().await;

        if tables.doctors.values().any(|d| d.ssn == doctor.ssn) {
            return Err(ClinicError::Conflict("Doctor with this SSN already exists".to_string()));
        }

        let id = Tables::next_id(&mut tables.next_doctor_id);
        let created = Doctor {
            id,
            ssn: doctor.ssn,
            name: doctor.name,
            specialties: doctor.specialties,
            experience: doctor.experience,
            opd_rate: doctor.opd_rate,
            is_available: true,
            phone: doctor.phone,
            profile_picture: doctor.profile_picture,
        };
        tables.doctors.insert(id, created.clone());
        Ok(created)
    }

    async fn find_doctor(&self, id: i64) -> Result<Option<Doctor>> {
        Ok(self.tables.read().await.doctors.get(&id).cloned())
    }

    async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        Ok(self.tables.read().await.doctors.values().cloned().collect())
    }

    async fn set_doctor_availability(&self, id: i64, is_available: bool) -> Result<Doctor> {
        let mut tables = self.tables.write().await;
        let doctor = tables
            .doctors
            .get_mut(&id)
            .ok_or_else(|| ClinicError::NotFound("Doctor not found".to_string()))?;
        doctor.is_available = is_available;
        Ok(doctor.clone())
    }

    async fn delete_doctor(&self, id: i64) -> Result<()> {
        // 加锁顺序：队列锁在前，表锁在后
        let mut queue = match self.existing_cell(id).await {
            Some(cell) => Some(self.lock_cell(cell, id).await?),
            None => None,
        };
        let mut tables = self.tables.write().await;

        if !tables.doctors.contains_key(&id) {
            return Err(ClinicError::NotFound("Doctor not found".to_string()));
        }
        if queue
            .as_deref()
            .is_some_and(|q| matches!(q, Some(q) if q.total_patients > 0))
        {
            return Err(ClinicError::Conflict("Doctor has patients waiting in queue".to_string()));
        }
        if tables.slots.values().any(|s| s.doctor_id == id && !s.is_available) {
            return Err(ClinicError::Conflict("Doctor has booked slots".to_string()));
        }

        tables.slots.retain(|_, s| s.doctor_id != id);
        tables.doctors.remove(&id);
        if let Some(guard) = queue.as_deref_mut() {
            *guard = None;
        }
        self.discard_cell(id).await;

        tracing::info!("Deleted doctor {}", id);
        Ok(())
    }

    async fn queue_snapshot(&self, doctor_id: i64) -> Result<Option<Queue>> {
        let Some(cell) = self.existing_cell(doctor_id).await else {
            return Ok(None);
        };
        let queue = self.lock_cell(cell, doctor_id).await?;
        Ok((*queue).clone())
    }

    async fn lock_queue(&self, doctor_id: i64, create_if_missing: bool) -> Result<Option<Box<dyn QueueTxn>>> {
        let cell = if create_if_missing {
            if !self.doctor_exists(doctor_id).await {
                return Err(ClinicError::NotFound("Doctor not found".to_string()));
            }
            self.cell_or_insert(doctor_id).await
        } else {
            match self.existing_cell(doctor_id).await {
                Some(cell) => cell,
                None => return Ok(None),
            }
        };
        let guard = self.lock_cell(cell, doctor_id).await?;

        let working = match &*guard {
            Some(queue) => queue.clone(),
            None if create_if_missing => {
                // 等锁期间医生可能已被删除
                if !self.doctor_exists(doctor_id).await {
                    drop(guard);
                    self.discard_cell(doctor_id).await;
                    return Err(ClinicError::NotFound("Doctor not found".to_string()));
                }
                Queue::new(doctor_id)
            }
            None => return Ok(None),
        };

        Ok(Some(Box::new(MemoryQueueTxn {
            guard: Some(guard),
            working,
        })))
    }

    async fn insert_slot(&self, slot: NewSlot) -> Result<Slot> {
        let mut tables = self.tables.write().await;

        if !tables.doctors.contains_key(&slot.doctor_id) {
            return Err(ClinicError::NotFound("Doctor not found".to_string()));
        }

        let id = Tables::next_id(&mut tables.next_slot_id);
        let created = Slot {
            id,
            doctor_id: slot.doctor_id,
            start_time: slot.start_time,
            end_time: slot.end_time,
            is_available: true,
            patient_id: None,
            slot_type: slot.slot_type,
        };
        tables.slots.insert(id, created.clone());
        Ok(created)
    }

    async fn find_slot(&self, id: i64) -> Result<Option<Slot>> {
        Ok(self.tables.read().await.slots.get(&id).cloned())
    }

    async fn list_available_slots(&self, doctor_id: i64, from: NaiveDateTime, to: NaiveDateTime) -> Result<Vec<Slot>> {
        let tables = self.tables.read().await;
        let mut slots: Vec<Slot> = tables
            .slots
            .values()
            .filter(|s| s.doctor_id == doctor_id && s.is_available && s.start_time >= from && s.start_time <= to)
            .cloned()
            .collect();
        slots.sort_by_key(|s| (s.start_time, s.id));
        Ok(slots)
    }

    async fn list_slots(&self) -> Result<Vec<Slot>> {
        let mut slots: Vec<Slot> = self.tables.read().await.slots.values().cloned().collect();
        slots.sort_by_key(|s| (s.start_time, s.id));
        Ok(slots)
    }

    async fn book_slot(&self, slot_id: i64, patient_id: i64) -> Result<Slot> {
        let mut tables = self.tables.write().await;

        if !tables.patients.contains_key(&patient_id) {
            return Err(ClinicError::NotFound("Patient not found".to_string()));
        }

        let slot = tables
            .slots
            .get_mut(&slot_id)
            .ok_or_else(|| ClinicError::NotFound("Slot not found".to_string()))?;

        if !slot.is_available {
            return Err(ClinicError::Conflict("Slot is no longer available".to_string()));
        }

        slot.is_available = false;
        slot.patient_id = Some(patient_id);
        Ok(slot.clone())
    }

    async fn release_slot(&self, slot_id: i64, patient_id: i64) -> Result<Slot> {
        let mut tables = self.tables.write().await;

        let slot = tables
            .slots
            .get_mut(&slot_id)
            .ok_or_else(|| ClinicError::NotFound("Slot not found".to_string()))?;

        if slot.patient_id != Some(patient_id) {
            return Err(ClinicError::Conflict("Slot is not booked by this patient".to_string()));
        }

        slot.is_available = true;
        slot.patient_id = None;
        Ok(slot.clone())
    }

    async fn delete_slot(&self, slot_id: i64) -> Result<()> {
        let mut tables = self.tables.write().await;

        match tables.slots.get(&slot_id) {
            None => Err(ClinicError::NotFound("Slot not found".to_string())),
            Some(slot) if !slot.is_available => Err(ClinicError::Conflict("Cannot delete a booked slot".to_string())),
            Some(_) => {
                tables.slots.remove(&slot_id);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 10, 1).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    async fn seeded() -> (MemoryStore, Doctor, Patient) {
        let store = MemoryStore::new(Duration::from_millis(200));
        let doctor = store
            .insert_doctor(NewDoctor {
                ssn: "918274".to_string(),
                name: "Dr. Smith".to_string(),
                specialties: vec!["General".to_string()],
                experience: 10,
                opd_rate: 100.0,
                phone: None,
                profile_picture: None,
            })
            .await
            .unwrap();
        let patient = store
            .insert_patient(NewPatient {
                ssn: "123456".to_string(),
                name: "John Doe".to_string(),
                phone: "5551234567".to_string(),
            })
            .await
            .unwrap();
        (store, doctor, patient)
    }

    #[tokio::test]
    async fn test_uncommitted_queue_txn_rolls_back() {
        let (store, doctor, _) = seeded().await;

        {
            let mut txn = store.lock_queue(doctor.id, true).await.unwrap().unwrap();
            txn.queue_mut().total_patients = 42;
        }

        assert!(store.queue_snapshot(doctor.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_lock_wait_is_bounded() {
        let (store, doctor, _) = seeded().await;

        let _held = store.lock_queue(doctor.id, true).await.unwrap().unwrap();
        let second = store.lock_queue(doctor.id, true).await;

        assert!(matches!(second, Err(ClinicError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_commit_twice_fails() {
        let (store, doctor, _) = seeded().await;

        let mut txn = store.lock_queue(doctor.id, true).await.unwrap().unwrap();
        txn.commit().await.unwrap();
        assert!(txn.commit().await.is_err());
        drop(txn);

        assert!(store.queue_snapshot(doctor.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_ssn_is_conflict() {
        let (store, _, _) = seeded().await;

        let duplicate = store
            .insert_patient(NewPatient {
                ssn: "123456".to_string(),
                name: "Someone Else".to_string(),
                phone: "5550000000".to_string(),
            })
            .await;

        assert!(matches!(duplicate, Err(ClinicError::Conflict(_))));
        assert_eq!(store.list_patients().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slot_compare_and_set() {
        let (store, doctor, patient) = seeded().await;
        let slot = store
            .insert_slot(NewSlot {
                doctor_id: doctor.id,
                start_time: at(9),
                end_time: at(10),
                slot_type: Default::default(),
            })
            .await
            .unwrap();

        let booked = store.book_slot(slot.id, patient.id).await.unwrap();
        assert!(!booked.is_available);
        assert_eq!(booked.patient_id, Some(patient.id));

        assert!(matches!(store.book_slot(slot.id, patient.id).await, Err(ClinicError::Conflict(_))));
        assert!(matches!(store.delete_slot(slot.id).await, Err(ClinicError::Conflict(_))));
        assert!(matches!(store.release_slot(slot.id, patient.id + 1).await, Err(ClinicError::Conflict(_))));

        let released = store.release_slot(slot.id, patient.id).await.unwrap();
        assert!(released.is_available);
        assert_eq!(released.patient_id, None);

        store.delete_slot(slot.id).await.unwrap();
        assert!(matches!(store.delete_slot(slot.id).await, Err(ClinicError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_doctor_with_booked_slot_is_refused() {
        let (store, doctor, patient) = seeded().await;
        let slot = store
            .insert_slot(NewSlot {
                doctor_id: doctor.id,
                start_time: at(9),
                end_time: at(10),
                slot_type: Default::default(),
            })
            .await
            .unwrap();
        store.book_slot(slot.id, patient.id).await.unwrap();

        assert!(matches!(store.delete_doctor(doctor.id).await, Err(ClinicError::Conflict(_))));

        store.release_slot(slot.id, patient.id).await.unwrap();
        store.delete_doctor(doctor.id).await.unwrap();
        assert!(store.find_doctor(doctor.id).await.unwrap().is_none());
        assert!(store.list_slots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_reads_do_not_allocate_cells() {
        let (store, doctor, _) = seeded().await;

        for ghost in 1000..3000 {
            assert!(store.queue_snapshot(ghost).await.unwrap().is_none());
            assert!(store.lock_queue(ghost, false).await.unwrap().is_none());
            assert!(matches!(store.lock_queue(ghost, true).await, Err(ClinicError::NotFound(_))));
        }
        assert!(store.queue_snapshot(doctor.id).await.unwrap().is_none());
        assert!(store.queues.lock().await.is_empty());

        let mut txn = store.lock_queue(doctor.id, true).await.unwrap().unwrap();
        txn.commit().await.unwrap();
        drop(txn);
        assert_eq!(store.queues.lock().await.len(), 1);

        store.delete_doctor(doctor.id).await.unwrap();
        assert!(store.queues.lock().await.is_empty());
        assert!(store.queue_snapshot(doctor.id).await.unwrap().is_none());
    }
}
