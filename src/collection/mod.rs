//! Reader identity and the registration handed to each reader
mod handle;
mod registration;

pub(crate) use handle::HandleAllocator;
pub use handle::{CollectionHandle, HandleSet};
pub use registration::{CollectionRegistration, RegisteredReader};
