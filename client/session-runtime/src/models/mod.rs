pub mod answer;
pub mod batch;
pub mod event;
pub mod integrity;
pub mod session;
pub mod timer;

pub use answer::{
    AnswerText, QuestionId, QuestionSessionEntry, SubmissionState, SubmitAttempt, SyncOutcome,
    SyncStatus,
};
pub use batch::{BatchJob, BatchProgress, BatchReport, ItemResult};
pub use event::SessionEvent;
pub use integrity::{
    IntegrityState, RawSignal, Signal, SignalOutcome, ViolationKind, ViolationRecord,
    WarningLevel,
};
pub use session::{
    CompletionAck, CompletionTrigger, SessionSnapshot, SessionStatus, TerminalStatus,
};
pub use timer::{BreakStatus, TimerState};
