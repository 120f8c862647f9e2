pub mod cart;
pub mod coupons;
pub mod idempotency;
pub mod maintenance;
pub mod order_status;
pub mod orders;
pub mod payments;
pub mod products;
pub mod stock;
