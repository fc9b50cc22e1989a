//! 号源分配
//!
//! 预约是对号源可用状态的比较并设置：并发预约同一号源时恰好一个成功，
//! 其余都得到 Conflict。号源时间是诊所本地的无时区时间。

use std::sync::Arc;

use chrono::{Duration, Local, NaiveDateTime};
use clinic_core::{CallerIdentity, ClinicError, ClinicStore, NewSlot, Result, Slot, SlotType};
use tracing::{debug, info, warn};

/// 预约窗口天数上限，超出的配置被截断
pub const MAX_BOOKING_WINDOW_DAYS: i64 = 3650;

/// 号源分配器
pub struct SlotAllocator {
    store: Arc<dyn ClinicStore>,
    booking_window: Duration,
}

impl SlotAllocator {
    /// `booking_window_days` 为可预约窗口的天数，窗口两端都包含在内
    pub fn new(store: Arc<dyn ClinicStore>, booking_window_days: i64) -> Self {
        Self {
            store,
            booking_window: Duration::days(booking_window_days.clamp(1, MAX_BOOKING_WINDOW_DAYS)),
        }
    }

    /// 为医生开放新号源
    pub async fn create_slot(
        &self,
        doctor_id: i64,
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
        slot_type: SlotType,
    ) -> Result<Slot> {
        if end_time <= start_time {
            return Err(ClinicError::InvalidArgument("End time must be after start time".to_string()));
        }
        if self.store.find_doctor(doctor_id).await?.is_none() {
            return Err(ClinicError::NotFound("Doctor not found".to_string()));
        }

        let slot = self
            .store
            .insert_slot(NewSlot {
                doctor_id,
                start_time,
                end_time,
                slot_type,
            })
            .await?;

        info!(
            "Created {} slot {} for doctor {} ({} - {})",
            slot.slot_type.as_str(),
            slot.id,
            doctor_id,
            slot.start_time,
            slot.end_time
        );
        Ok(slot)
    }

    /// 从现在起预约窗口内的可用号源
    pub async fn list_available(&self, doctor_id: i64) -> Result<Vec<Slot>> {
        self.list_available_from(doctor_id, Local::now().naive_local()).await
    }

    /// 从 `from` 起预约窗口内的可用号源，按开始时间升序
    pub async fn list_available_from(&self, doctor_id: i64, from: NaiveDateTime) -> Result<Vec<Slot>> {
        let to = from.checked_add_signed(self.booking_window).unwrap_or(NaiveDateTime::MAX);
        let slots = self.store.list_available_slots(doctor_id, from, to).await?;

        debug!("Doctor {} has {} available slots between {} and {}", doctor_id, slots.len(), from, to);
        Ok(slots)
    }

    /// 为患者预约号源
    pub async fn book(&self, slot_id: i64, patient_id: i64, caller: &CallerIdentity) -> Result<Slot> {
        caller.ensure_acts_for(patient_id, "Unauthorized to book for another patient")?;

        if self.store.find_patient(patient_id).await?.is_none() {
            return Err(ClinicError::NotFound("Patient not found".to_string()));
        }

        match self.store.book_slot(slot_id, patient_id).await {
            Ok(slot) => {
                info!("Patient {} booked slot {} with doctor {}", patient_id, slot.id, slot.doctor_id);
                Ok(slot)
            }
            Err(e) => {
                warn!("Booking of slot {} by patient {} failed: {}", slot_id, patient_id, e);
                Err(e)
            }
        }
    }

    /// 患者取消自己的预约
    pub async fn release(&self, slot_id: i64, patient_id: i64, caller: &CallerIdentity) -> Result<Slot> {
        caller.ensure_acts_for(patient_id, "Unauthorized to release a slot for another patient")?;

        let slot = self.store.release_slot(slot_id, patient_id).await?;
        info!("Patient {} released slot {}", patient_id, slot_id);
        Ok(slot)
    }

    /// 删除号源；已预约的号源不能删除
    pub async fn delete(&self, slot_id: i64) -> Result<()> {
        self.store.delete_slot(slot_id).await?;
        info!("Deleted slot {}", slot_id);
        Ok(())
    }

    pub async fn list_all(&self) -> Result<Vec<Slot>> {
        self.store.list_slots().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use clinic_core::{NewDoctor, NewPatient};
    use clinic_database::MemoryStore;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 10, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    async fn setup(patients: usize) -> (SlotAllocator, i64, Vec<CallerIdentity>) {
        let store: Arc<dyn ClinicStore> = Arc::new(MemoryStore::default());

        let doctor = store
            .insert_doctor(NewDoctor {
                ssn: "918376".to_string(),
                name: "Dr. Smith".to_string(),
                specialties: vec!["General".to_string()],
                experience: 10,
                opd_rate: 100.0,
                phone: None,
                profile_picture: None,
            })
            .await
            .unwrap();

        let mut callers = Vec::new();
        for i in 0..patients {
            let patient = store
                .insert_patient(NewPatient {
                    ssn: format!("{:06}", 200000 + i),
                    name: format!("Patient {}", i),
                    phone: "5551234567".to_string(),
                })
                .await
                .unwrap();
            callers.push(CallerIdentity { patient_id: patient.id, ssn: patient.ssn });
        }

        (SlotAllocator::new(store, 7), doctor.id, callers)
    }

    #[tokio::test]
    async fn test_booking_scenario() {
        let (allocator, doctor_id, callers) = setup(2).await;
        let (p, q) = (&callers[0], &callers[1]);

        let slot = allocator
            .create_slot(doctor_id, at(1, 9), at(1, 10), SlotType::Appointment)
            .await
            .unwrap();
        assert!(slot.is_available);
        assert_eq!(slot.patient_id, None);

        let booked = allocator.book(slot.id, p.patient_id, p).await.unwrap();
        assert!(!booked.is_available);
        assert_eq!(booked.patient_id, Some(p.patient_id));

        let err = allocator.book(slot.id, q.patient_id, q).await.unwrap_err();
        assert_eq!(err.message(), "Slot is no longer available");

        let err = allocator.delete(slot.id).await.unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_slot_validation() {
        let (allocator, doctor_id, _) = setup(0).await;

        let err = allocator
            .create_slot(doctor_id, at(1, 10), at(1, 9), SlotType::Appointment)
            .await
            .unwrap_err();
        assert_eq!(err.message(), "End time must be after start time");

        let err = allocator
            .create_slot(doctor_id, at(1, 9), at(1, 9), SlotType::WalkIn)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidArgument(_)));

        let err = allocator
            .create_slot(doctor_id + 1, at(1, 9), at(1, 10), SlotType::Appointment)
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Doctor not found");
    }

    #[tokio::test]
    async fn test_book_guards() {
        let (allocator, doctor_id, callers) = setup(2).await;
        let slot = allocator
            .create_slot(doctor_id, at(1, 9), at(1, 10), SlotType::Appointment)
            .await
            .unwrap();

        let err = allocator.book(slot.id, callers[1].patient_id, &callers[0]).await.unwrap_err();
        assert_eq!(err.message(), "Unauthorized to book for another patient");
        assert!(matches!(err, ClinicError::Forbidden(_)));

        let ghost = CallerIdentity { patient_id: 404, ssn: "404404".to_string() };
        let err = allocator.book(slot.id, 404, &ghost).await.unwrap_err();
        assert_eq!(err.message(), "Patient not found");

        let err = allocator.book(slot.id + 50, callers[0].patient_id, &callers[0]).await.unwrap_err();
        assert_eq!(err.message(), "Slot not found");

        // 失败的预约不改变号源
        let listed = allocator.list_available_from(doctor_id, at(1, 0)).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_available_window_is_inclusive_and_ordered() {
        let (allocator, doctor_id, callers) = setup(1).await;

        let late = allocator.create_slot(doctor_id, at(8, 9), at(8, 10), SlotType::Appointment).await.unwrap();
        let early = allocator.create_slot(doctor_id, at(1, 9), at(1, 10), SlotType::Appointment).await.unwrap();
        let outside = allocator.create_slot(doctor_id, at(8, 10), at(8, 11), SlotType::Appointment).await.unwrap();
        let booked = allocator.create_slot(doctor_id, at(2, 9), at(2, 10), SlotType::WalkIn).await.unwrap();
        allocator.book(booked.id, callers[0].patient_id, &callers[0]).await.unwrap();

        let listed = allocator.list_available_from(doctor_id, at(1, 9)).await.unwrap();
        let ids: Vec<i64> = listed.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
        assert!(!ids.contains(&outside.id));

        assert_eq!(allocator.list_all().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_release_and_delete() {
        let (allocator, doctor_id, callers) = setup(2).await;
        let (p, q) = (&callers[0], &callers[1]);
        let slot = allocator.create_slot(doctor_id, at(1, 9), at(1, 10), SlotType::Appointment).await.unwrap();

        allocator.book(slot.id, p.patient_id, p).await.unwrap();

        let err = allocator.release(slot.id, q.patient_id, q).await.unwrap_err();
        assert_eq!(err.message(), "Slot is not booked by this patient");

        let released = allocator.release(slot.id, p.patient_id, p).await.unwrap();
        assert!(released.is_available);
        assert_eq!(released.patient_id, None);

        allocator.delete(slot.id).await.unwrap();
        let err = allocator.delete(slot.id).await.unwrap_err();
        assert_eq!(err.message(), "Slot not found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_booking_has_single_winner() {
        let (allocator, doctor_id, callers) = setup(12).await;
        let slot = allocator.create_slot(doctor_id, at(1, 9), at(1, 10), SlotType::Appointment).await.unwrap();
        let slot_id = slot.id;
        let allocator = Arc::new(allocator);

        let handles: Vec<_> = callers
            .into_iter()
            .map(|caller| {
                let allocator = allocator.clone();
                tokio::spawn(async move { allocator.book(slot_id, caller.patient_id, &caller).await })
            })
            .collect();

        let mut winners = Vec::new();
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(slot) => winners.push(slot.patient_id),
                Err(ClinicError::Conflict(_)) => conflicts += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts, 11);

        let stored = allocator.list_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, slot_id);
        assert!(!stored[0].is_available);
        assert_eq!(stored[0].patient_id, winners[0]);
        assert!(winners[0].is_some());
    }

    #[tokio::test]
    async fn test_oversized_window_is_clamped() {
        let store: Arc<dyn ClinicStore> = Arc::new(MemoryStore::default());
        let doctor = store
            .insert_doctor(NewDoctor {
                ssn: "918377".to_string(),
                name: "Dr. Far".to_string(),
                specialties: Vec::new(),
                experience: 1,
                opd_rate: 50.0,
                phone: None,
                profile_picture: None,
            })
            .await
            .unwrap();
        let allocator = SlotAllocator::new(store, i64::MAX);
        assert_eq!(allocator.booking_window, Duration::days(MAX_BOOKING_WINDOW_DAYS));

        let slot = allocator.create_slot(doctor.id, at(1, 9), at(1, 10), SlotType::Appointment).await.unwrap();
        let listed = allocator.list_available_from(doctor.id, at(1, 0)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, slot.id);

        // 窗口末端越过可表示的最大时间时截断而不是溢出
        let listed = allocator.list_available_from(doctor.id, NaiveDateTime::MAX - Duration::days(1)).await.unwrap();
        assert!(listed.is_empty());
    }
}
