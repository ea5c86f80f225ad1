//! Top-level facade over the Espresso CPU core and Latte shader translator
//! workspace. Downstream consumers (and this crate's own `tests/`) depend on
//! the individual `esp-*` crates directly; this crate exists to give the
//! workspace a single buildable root target and a place to document how the
//! pieces fit together.

pub use esp_cpu as cpu;
pub use esp_engine as engine;
pub use esp_latte as latte;
pub use esp_spirv as spirv;
