mod spec;
mod state;
mod types;

pub use spec::{VirtualMachineSpec, VirtualMachineSpecBuilder, VirtualMachineState};
pub use state::{
    AutomaticActions, AutomaticStartAction, AutomaticStopAction, Generation, RequestedState,
    ShutdownType, VmState,
};
pub use types::*;
