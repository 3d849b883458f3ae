//! One module per table.

pub mod accrued_commission;
pub mod cash_alert;
pub mod cash_shift;
pub mod client;
pub mod commission_config;
pub mod document_counter;
pub mod employee;
pub mod inventory_alert;
pub mod inventory_movement;
pub mod manual_payable;
pub mod part;
pub mod payable_payment;
pub mod payment;
pub mod purchase_order;
pub mod purchase_order_line;
pub mod sale;
pub mod sale_cancellation_detail;
pub mod sale_line;
pub mod service_item;
pub mod supplier;
pub mod vehicle;
pub mod work_order;
pub mod work_order_note;
pub mod work_order_part_line;
pub mod work_order_service_line;
