pub mod dlq;
pub mod order_canceled;
pub mod order_create;
