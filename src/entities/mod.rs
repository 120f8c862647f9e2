pub mod cart_item;
pub mod coupon;
pub mod idempotency_record;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod product;
pub mod stock_reservation;
pub mod webhook_event;
