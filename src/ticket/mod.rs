//! Ticket domain model and identifier formats.

pub mod ids;
pub mod model;

pub use ids::{format_final_id, format_temp_id, ticket_day};
pub use model::{
    Category, FollowUpKind, PendingFollowUp, Priority, Stage, StageTransition, Status, Ticket,
    TranscriptEntry,
};
