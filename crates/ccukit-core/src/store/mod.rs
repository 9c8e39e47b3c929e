// Stores: device registry, paramset cache, value store, ReGa index,
// persistence. All concurrent maps; mutation happens on the session's
// dispatch task, reads from anywhere.

mod paramsets;
mod persist;
mod rega;
mod registry;
mod values;

pub use paramsets::{FetchRequest, ParamsetCache, paramset_key};
pub use persist::Persistence;
pub use rega::{RegaIndex, RegaSnapshot};
pub use registry::DeviceRegistry;
pub use values::ValueStore;
