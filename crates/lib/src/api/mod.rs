//! Backend REST client.
//!
//! Thin typed wrappers over the Medra HTTP API (auth, patients, chats, messages, upload).
//! The streaming endpoint lives in [`crate::stream`].

mod client;
mod types;

pub use client::{ApiClient, ApiError};
pub use types::{
    AuthResponse, ChatSummary, Message, NewPatient, Patient, PatientFile, PatientProfile,
    ProfileMessage, UploadInfo, UserInfo,
};
