pub mod block;

pub use block::{AckKind, Block, CtlKind, HelloKind, PingKind};
