pub mod engine;
pub mod logic;

pub use engine::{EnginePhase, EngineSnapshot, RsiZone, SignalFeed, SwingEngine};
pub use logic::{step, StepConfig, StepEvent, SwingAction, SwingState};
