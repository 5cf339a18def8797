use thiserror::Error;

/// Numeric codes surfaced in API envelopes.
pub mod code {
    pub const SUCCESS: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const INVALID_PARAMS: i32 = 2;

    pub const ERROR_AUTH_CHECK_TOKEN_FAIL: i32 = 10001;
    pub const ERROR_AUTH_CHECK_TOKEN_TIMEOUT: i32 = 10002;
    pub const ERROR_AUTH: i32 = 10004;

    pub const ERROR_PRODUCT_NOT_EXISTS: i32 = 30001;
    pub const ERROR_STOCK_NOT_ENOUGH: i32 = 30002;

    pub const ERROR_ORDER_STATUS_CHANGED: i32 = 40001;
}

#[derive(Debug, Error)]
pub enum StockError {
    #[error("stock not enough")]
    OutOfStock,
    #[error("product not found")]
    ProductNotFound,
    #[error("stock return exceeds upper bound")]
    ReturnOverflow,
    #[error("stock store unavailable: {0}")]
    Unavailable(String),
    #[error("stock engine internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid request: {0}")]
    Validation(&'static str),
    #[error("product does not exist")]
    ProductNotFound,
    #[error("seckill has not started")]
    NotStarted,
    #[error("seckill has ended")]
    Ended,
    #[error("you already joined this seckill")]
    AlreadyJoined,
    #[error("product is out of stock")]
    OutOfStock,
    #[error("system busy, please retry")]
    Busy,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order not found")]
    NotFound,
    #[error("order belongs to another user")]
    Forbidden,
    #[error("order status already changed")]
    StatusChanged,
    #[error("order store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("token verification failed")]
    Invalid,
}
