//! Tauri command layer.
//!
//! Thin `#[tauri::command]` wrappers that parse loosely-typed frontend
//! payloads and delegate to the domain modules. The in-progress checkout,
//! split payment, and refund draft live here as managed session state.

pub mod checkout;
pub mod customers;
pub mod discounts;
pub mod gift_cards;
pub mod house_accounts;
pub mod orders;
pub mod refunds;
pub mod settings;
pub mod split;
pub mod transactions;
