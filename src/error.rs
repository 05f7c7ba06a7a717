// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CamError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Camera '{id}' not found")]
    CameraNotFound { id: String },

    #[error("Camera '{id}' is disabled")]
    CameraDisabled { id: String },

    #[error("RTSP stream unreachable: {url}: {reason}")]
    RtspUnreachable { url: String, reason: String },

    #[error("Insufficient disk space in {path}: {available_gb:.2} GB available, {required_gb} GB required")]
    DiskSpace {
        path: String,
        available_gb: f64,
        required_gb: u64,
    },

    #[error("No active session for camera '{id}'")]
    NoActiveSession { id: String },
}

pub type Result<T> = std::result::Result<T, CamError>;
