use backup_core::BackupError;

#[derive(thiserror::Error, Debug)]
pub enum DrError {
    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("Workload control failed: {0}")]
    Workload(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Disaster recovery cancelled: {0}")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, DrError>;
