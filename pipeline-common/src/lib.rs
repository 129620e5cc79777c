pub mod dead_letter;
pub mod event;
pub mod fingerprint;
pub mod health;
pub mod metrics;
pub mod retry;
