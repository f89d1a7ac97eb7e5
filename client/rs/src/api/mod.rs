/// Operations that mutate remote state.
pub mod execute;
/// Read only operations.
pub mod read;
