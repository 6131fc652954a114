use thiserror::Error;

pub type Result<T> = std::result::Result<T, SeckillError>;

#[derive(Debug, Error)]
pub enum SeckillError {
    #[error("insufficient stock")]
    SoldOut,

    #[error("duplicate order")]
    AlreadyPurchased,

    #[error("seckill has not started")]
    NotStarted,

    #[error("seckill has ended")]
    Ended,

    #[error("voucher not found: {0}")]
    VoucherNotFound(i64),

    #[error("lock busy: {0}")]
    LockBusy(String),

    #[error("store unavailable: {0:#}")]
    TransientStoreFailure(anyhow::Error),
}

impl SeckillError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        SeckillError::TransientStoreFailure(err.into())
    }

    /// Whether the same request may succeed if simply tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SeckillError::LockBusy(_) | SeckillError::TransientStoreFailure(_)
        )
    }
}
