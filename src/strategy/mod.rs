pub mod move_selector;
pub mod phase_machine;

pub use move_selector::{MoveSelector, RandomSelector};
pub use phase_machine::{decide, Decision, MachineConfig, PhaseMachine, Services, StepOutcome};
