//! Concrete `Provider` implementations: a `FakeProvider` double re-exported
//! from `broker_core::testutil` for scenario tests, and a `RestProvider`
//! speaking the generic JSON/REST marketplace protocol common to
//! TensorDock- and vast.ai-class providers.

mod rest;

pub use broker_core::testutil::FakeProvider;
pub use rest::RestProvider;
