pub mod node;
pub mod pool;
pub mod subscription;

pub use node::{NewNode, Node, NodeLoad, Strategy};
pub use pool::{NewPoolEntry, PoolEntry};
pub use subscription::{Account, Grant, NewGrant, NewSubscription, Subscription};
