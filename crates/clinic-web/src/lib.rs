//! # 诊所Web模块
//!
//! REST接口、访问网关和统一的响应信封。

pub mod auth;
pub mod handlers;
pub mod server;

pub use auth::AccessGate;
pub use handlers::ApiError;
pub use server::{create_app, AppState, WebServer};
