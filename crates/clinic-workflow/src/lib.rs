//! # 诊所工作流模块
//!
//! 患者流转的业务逻辑，全部建立在 [`clinic_core::ClinicStore`] 之上：
//! - 候诊队列：每个医生一个先进先出队列，位置连续
//! - 号源分配：原子的比较并设置预约
//! - 名册：患者和医生的注册、核验与签到

pub mod queue;
pub mod registry;
pub mod slots;

// 重新导出主要类型
pub use queue::{AdvanceOutcome, JoinTicket, QueueManager, QueuePosition, QueueStatus, MINUTES_PER_PATIENT};
pub use registry::{CheckInOutcome, DoctorRegistration, PatientRegistration, Registry};
pub use slots::SlotAllocator;
