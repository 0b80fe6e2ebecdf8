pub mod scenario;
pub mod simulation;
