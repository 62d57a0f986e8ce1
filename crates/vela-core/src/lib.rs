//! # vela-core
//!
//! Core types for the Vela attention runtime.
//!
//! Provides:
//! - `DType` and the `Element` trait for bf16/f32/i32/i64 scalars
//! - A typed host `Tensor` (shape + tagged element vector)
//! - Bulk f32 ↔ bf16 conversion
//! - `BufferPool`, the tagged and growable scratch-memory pool
//! - `VelaError`, shared by every Vela crate

pub mod codec;
pub mod dtype;
pub mod element;
pub mod error;
pub mod pool;
pub mod shape;
pub mod tensor;

pub use dtype::DType;
pub use element::Element;
pub use error::VelaError;
pub use pool::{BufferPool, BufferTag, LeaseGuard, PoolConfig, PoolLease, PoolStats};
pub use shape::Shape;
pub use tensor::{Tensor, TensorData};

pub use half::bf16;

pub type Result<T> = std::result::Result<T, VelaError>;
