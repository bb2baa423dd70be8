pub mod case;
pub mod generator;
pub mod prompts;
pub mod result;
pub mod retry;
pub mod step;

#[cfg(test)]
mod testing;

pub use case::{CaseOrchestrator, CasePhase};
pub use generator::{
    parse_candidate_set, parse_structured_steps, CandidateInstructionSet, InstructionGenerator, LlmInstructionGenerator,
    LlmStepTranslator, StepTranslator,
};
pub use result::{Attempt, CaseResult, StepExecutionResult, Tier};
pub use retry::{Backoff, RetryPolicy};
pub use step::{is_initial_state_assertion, StepOrchestrator};
