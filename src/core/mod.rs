//! Core domain models: worker identity, roles and status.

pub mod worker;

pub use worker::{Operation, Role, Worker, WorkerId, WorkerStatus, ROOT_ID};
