use std::any::Any;
use std::sync::Arc;

/// An opaque, owned transport address (`hg_addr_t` equivalent).
#[derive(Clone)]
pub struct Address(pub Arc<dyn Any + Send + Sync>);

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address(..)")
    }
}
