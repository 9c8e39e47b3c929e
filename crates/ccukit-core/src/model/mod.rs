// Domain model: wire descriptors, parameter schemas, normalized records.

mod device;
mod paramset;
mod record;
mod rega;

pub use device::DeviceDescription;
pub use paramset::{ParameterDescription, ParameterType, ParamsetDescription, paramset_from_wire};
pub use record::{ValueRecord, now_ms};
pub use rega::{Program, SysVar, value_type};
